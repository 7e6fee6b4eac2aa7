//! # tagsync-core: Values and Namespaces
//!
//! Pure building blocks for the tagsync client: the application value model,
//! its JSON wire codec, and namespace path derivation.
//!
//! ## Crate Organization
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         tagsync-core                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐    │
//! │  │   value     │    │   codec     │    │   path                   │    │
//! │  │             │    │             │    │                          │    │
//! │  │  Value enum │───►│ ValueCodec  │    │  Namespace (4 segments)  │    │
//! │  │  (absent,   │    │ encode()    │    │  NamespacePath           │    │
//! │  │   list ...) │◄───│ decode()    │    │  (endpoint + node)       │    │
//! │  └─────────────┘    └─────────────┘    └──────────────────────────┘    │
//! │                                                                         │
//! │  ┌─────────────┐                                                       │
//! │  │   error     │  CodecError (Encoding / Decoding)                     │
//! │  └─────────────┘                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tagsync_core::{Namespace, Value, ValueCodec};
//!
//! let wire = ValueCodec::encode(&Value::from(10)).unwrap();
//! assert_eq!(wire, "10");
//! assert_eq!(ValueCodec::decode(&wire).unwrap(), Value::Integer(10));
//!
//! let ns = Namespace::new("ws://hub.local/", "alice/", "proj1");
//! assert_eq!(ns.path().node(), "proj1");
//! ```

pub mod codec;
pub mod error;
pub mod path;
pub mod value;

pub use codec::ValueCodec;
pub use error::{CodecError, CodecResult};
pub use path::{shared_node, Namespace, NamespacePath, DEFAULT_ENDPOINT, SHARED_MODE_SEGMENT};
pub use value::Value;
