//! # Namespace Paths
//!
//! Derives the address of the remote subtree a client operates on.
//!
//! ## Derivation Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Namespace → NamespacePath                           │
//! │                                                                         │
//! │  SHARED STORE (endpoint == DEFAULT_ENDPOINT)                           │
//! │  ───────────────────────────────────────────                           │
//! │  node = "developers/" + developer_bucket + project_bucket              │
//! │  e.g.  ws://127.0.0.1:8765/ + developers/alice/proj1                   │
//! │                                                                         │
//! │  CUSTOM STORE                                                          │
//! │  ────────────                                                          │
//! │  node = project_bucket                                                 │
//! │  e.g.  wss://db.example.com/ + proj1                                   │
//! │                                                                         │
//! │  address = endpoint + node                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Buckets are concatenated as-is. The developer bucket carries its own
//! trailing separator (`"alice/"`).

use std::fmt;

/// Endpoint of the shared store.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8765/";

/// Mode segment prefixed to nodes on the shared store.
pub const SHARED_MODE_SEGMENT: &str = "developers/";

/// The configurable segments a path is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// Base URL of the remote store.
    pub endpoint: String,
    /// Per-developer bucket (shared store only).
    pub developer_bucket: String,
    /// Per-project bucket.
    pub project_bucket: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            developer_bucket: String::new(),
            project_bucket: String::new(),
        }
    }
}

impl Namespace {
    /// Creates a namespace from its three segments.
    pub fn new(
        endpoint: impl Into<String>,
        developer_bucket: impl Into<String>,
        project_bucket: impl Into<String>,
    ) -> Self {
        Namespace {
            endpoint: endpoint.into(),
            developer_bucket: developer_bucket.into(),
            project_bucket: project_bucket.into(),
        }
    }

    /// Derives the path for the current segments.
    pub fn path(&self) -> NamespacePath {
        NamespacePath::derive(&self.endpoint, &self.developer_bucket, &self.project_bucket)
    }
}

/// Fully-qualified address of a remote subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacePath {
    endpoint: String,
    node: String,
    shared: bool,
}

impl NamespacePath {
    /// Applies the derivation rule to the given segments.
    pub fn derive(endpoint: &str, developer_bucket: &str, project_bucket: &str) -> Self {
        let shared = endpoint == DEFAULT_ENDPOINT;
        let node = if shared {
            format!("{}{}{}", SHARED_MODE_SEGMENT, developer_bucket, project_bucket)
        } else {
            project_bucket.to_string()
        };
        NamespacePath {
            endpoint: endpoint.to_string(),
            node,
            shared,
        }
    }

    /// Builds a path from an endpoint and an already-derived node.
    pub fn from_parts(endpoint: impl Into<String>, node: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let shared = endpoint == DEFAULT_ENDPOINT;
        NamespacePath {
            endpoint,
            node: node.into(),
            shared,
        }
    }

    /// Base URL of the store holding this subtree.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Node path within the store.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// `endpoint + node`.
    pub fn address(&self) -> String {
        format!("{}{}", self.endpoint, self.node)
    }

    /// True when the path lives on the shared store.
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.endpoint, self.node)
    }
}

/// Node path a credential for `developer` + `project` is scoped to.
pub fn shared_node(developer: &str, project: &str) -> String {
    format!("{}{}{}", SHARED_MODE_SEGMENT, developer, project)
}
