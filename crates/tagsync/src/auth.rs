//! # Authentication
//!
//! Decides when a namespace path needs (re)authentication and mints or checks
//! signed credentials.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        AuthCoordinator                                  │
//! │                                                                         │
//! │  ┌─────────────────┐  begin(path needs auth)  ┌─────────────────┐      │
//! │  │ Unauthenticated │ ───────────────────────► │ Authenticating  │      │
//! │  └─────────────────┘                          └────────┬────────┘      │
//! │          ▲                                   ok        │      err      │
//! │          │ path changed               ┌────────────────┴────────┐      │
//! │          │                            ▼                         ▼      │
//! │          │                  ┌─────────────────┐       ┌─────────────┐  │
//! │          └──────────────────│  Authenticated  │       │ AuthFailed  │  │
//! │                             └─────────────────┘       └─────────────┘  │
//! │                                                                         │
//! │  AuthFailed is terminal for the attempt. The next reconfiguration     │
//! │  starts over. Operations continue unauthenticated in the meantime.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Credentials
//! A user-supplied credential is used as-is for whatever path is active. A
//! credential minted by a [`TokenIssuer`] is bound to the path it was minted
//! for and is dropped once the path changes, so the next reconfiguration
//! mints a fresh one.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tagsync_core::{shared_node, Namespace, NamespacePath};
use tracing::debug;

use crate::error::{RemoteOperation, SyncError, SyncResult};
use crate::store::Completion;

// =============================================================================
// State
// =============================================================================

/// Authentication state of the active path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    AuthFailed,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Unauthenticated => write!(f, "unauthenticated"),
            AuthState::Authenticating => write!(f, "authenticating"),
            AuthState::Authenticated => write!(f, "authenticated"),
            AuthState::AuthFailed => write!(f, "auth_failed"),
        }
    }
}

/// An authentication token and, if it was minted by an issuer, the path it
/// was minted for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credential {
    token: String,
    issued_for: Option<NamespacePath>,
}

impl Credential {
    /// A token supplied by the application.
    pub fn user(token: impl Into<String>) -> Self {
        Credential {
            token: token.into(),
            issued_for: None,
        }
    }

    /// A token minted for `path`.
    pub fn issued(token: impl Into<String>, path: NamespacePath) -> Self {
        Credential {
            token: token.into(),
            issued_for: Some(path),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// The credential to use on `path`: unchanged, or empty if it was minted
    /// for another path.
    pub fn for_path(&self, path: &NamespacePath) -> Credential {
        match &self.issued_for {
            Some(issued) if issued != path => Credential::default(),
            _ => self.clone(),
        }
    }
}

/// What the client has to do next to satisfy authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// The path does not need a credential.
    NotRequired,
    /// The session is already authenticated for this path and token.
    AlreadyAuthenticated,
    /// Mint a credential first, then call `begin` again.
    IssueToken { developer: String, project: String },
    /// Authenticate with this token.
    Authenticate(String),
    /// The path needs a credential and none can be obtained.
    MissingCredential,
}

/// Tracks authentication for the single active path.
#[derive(Debug, Default)]
pub struct AuthCoordinator {
    state: AuthState,
    bound: Option<(NamespacePath, String)>,
}

impl AuthCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// True when the path needs a credential: one is set, or the path is on
    /// the shared store.
    pub fn requires_auth(path: &NamespacePath, credential: &Credential) -> bool {
        !credential.is_empty() || path.is_shared()
    }

    /// Decides the next step for entering `namespace` with `credential`.
    ///
    /// `credential` must already be normalised with [`Credential::for_path`].
    pub fn begin(
        &mut self,
        namespace: &Namespace,
        credential: &Credential,
        can_issue: bool,
    ) -> AuthStep {
        let path = namespace.path();

        if self.state == AuthState::Authenticated {
            if let Some((bound_path, bound_token)) = &self.bound {
                if *bound_path == path && bound_token == credential.token() {
                    return AuthStep::AlreadyAuthenticated;
                }
            }
        }
        self.bound = None;

        if !Self::requires_auth(&path, credential) {
            self.state = AuthState::Unauthenticated;
            return AuthStep::NotRequired;
        }

        if !credential.is_empty() {
            self.state = AuthState::Authenticating;
            return AuthStep::Authenticate(credential.token().to_string());
        }

        if can_issue {
            self.state = AuthState::Authenticating;
            return AuthStep::IssueToken {
                developer: namespace.developer_bucket.clone(),
                project: namespace.project_bucket.clone(),
            };
        }

        self.state = AuthState::AuthFailed;
        AuthStep::MissingCredential
    }

    /// Records a successful authentication of `token` on `path`.
    pub fn complete(&mut self, path: &NamespacePath, token: &str) {
        debug!(path = %path, "Authenticated");
        self.state = AuthState::Authenticated;
        self.bound = Some((path.clone(), token.to_string()));
    }

    /// Records a failed attempt.
    pub fn fail(&mut self) {
        self.state = AuthState::AuthFailed;
        self.bound = None;
    }
}

// =============================================================================
// Issuing and Verifying
// =============================================================================

/// Mints credentials from a namespace identity.
pub trait TokenIssuer: Send + Sync {
    /// Mints a token for `developer` + `project`. `done` may run on any thread.
    fn issue_token(&self, developer: &str, project: &str, done: Completion<String>);
}

/// Checks a credential against the path it is presented for.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, path: &NamespacePath) -> SyncResult<()>;
}

/// Claims carried by a namespace credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceClaims {
    /// Developer bucket the token was minted for.
    pub developer: String,
    /// Project bucket the token was minted for.
    pub project: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

/// HMAC-signed credential issuer.
pub struct JwtTokenIssuer {
    secret: String,
    lifetime_secs: i64,
}

impl JwtTokenIssuer {
    pub fn new(secret: impl Into<String>, lifetime_secs: i64) -> Self {
        JwtTokenIssuer {
            secret: secret.into(),
            lifetime_secs,
        }
    }

    /// Mints a token synchronously.
    pub fn issue(&self, developer: &str, project: &str) -> SyncResult<String> {
        let now = Utc::now();
        let claims = NamespaceClaims {
            developer: developer.to_string(),
            project: project.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.lifetime_secs)).timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| SyncError::remote(RemoteOperation::IssueToken, e.to_string()))
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue_token(&self, developer: &str, project: &str, done: Completion<String>) {
        done(self.issue(developer, project))
    }
}

/// Verifies tokens minted by [`JwtTokenIssuer`] with the same secret.
pub struct JwtTokenVerifier {
    secret: String,
}

impl JwtTokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        JwtTokenVerifier {
            secret: secret.into(),
        }
    }

    /// Decodes and validates signature and expiry.
    pub fn claims(&self, token: &str) -> SyncResult<NamespaceClaims> {
        let data = decode::<NamespaceClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, token: &str, path: &NamespacePath) -> SyncResult<()> {
        let claims = self.claims(token)?;
        if shared_node(&claims.developer, &claims.project) != path.node() {
            return Err(SyncError::AuthFailed(format!(
                "token for {}{} is not valid for {}",
                claims.developer,
                claims.project,
                path.node()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagsync_core::DEFAULT_ENDPOINT;

    fn shared_ns(dev: &str, proj: &str) -> Namespace {
        Namespace::new(DEFAULT_ENDPOINT, dev, proj)
    }

    #[test]
    fn test_shared_path_without_credential_issues() {
        let mut auth = AuthCoordinator::new();
        let step = auth.begin(&shared_ns("alice/", "proj1"), &Credential::default(), true);
        assert_eq!(
            step,
            AuthStep::IssueToken {
                developer: "alice/".into(),
                project: "proj1".into()
            }
        );
        assert_eq!(auth.state(), AuthState::Authenticating);
    }

    #[test]
    fn test_missing_credential_without_issuer() {
        let mut auth = AuthCoordinator::new();
        let step = auth.begin(&shared_ns("alice/", "proj1"), &Credential::default(), false);
        assert_eq!(step, AuthStep::MissingCredential);
        assert_eq!(auth.state(), AuthState::AuthFailed);
    }

    #[test]
    fn test_custom_store_without_credential_skips_auth() {
        let mut auth = AuthCoordinator::new();
        let ns = Namespace::new("wss://db.example.com/", "", "proj1");
        assert_eq!(auth.begin(&ns, &Credential::default(), true), AuthStep::NotRequired);
    }

    #[test]
    fn test_authenticated_path_is_not_redone() {
        let mut auth = AuthCoordinator::new();
        let ns = shared_ns("alice/", "proj1");
        let cred = Credential::user("tok");

        assert_eq!(auth.begin(&ns, &cred, false), AuthStep::Authenticate("tok".into()));
        auth.complete(&ns.path(), "tok");
        assert_eq!(auth.begin(&ns, &cred, false), AuthStep::AlreadyAuthenticated);

        // New path: authentication does not carry over.
        let other = shared_ns("alice/", "proj2");
        assert_eq!(auth.begin(&other, &cred, false), AuthStep::Authenticate("tok".into()));
    }

    #[test]
    fn test_failure_is_retried_on_next_begin() {
        let mut auth = AuthCoordinator::new();
        let ns = shared_ns("alice/", "proj1");
        let cred = Credential::user("bad");
        auth.begin(&ns, &cred, false);
        auth.fail();
        assert_eq!(auth.state(), AuthState::AuthFailed);
        assert_eq!(auth.begin(&ns, &cred, false), AuthStep::Authenticate("bad".into()));
    }

    #[test]
    fn test_issued_credential_is_path_bound() {
        let p1 = shared_ns("alice/", "proj1").path();
        let p2 = shared_ns("alice/", "proj2").path();

        let issued = Credential::issued("t1", p1.clone());
        assert_eq!(issued.for_path(&p1), issued);
        assert!(issued.for_path(&p2).is_empty());

        let user = Credential::user("mine");
        assert_eq!(user.for_path(&p2), user);
    }

    #[test]
    fn test_jwt_issue_and_verify() {
        let issuer = JwtTokenIssuer::new("secret", 3600);
        let verifier = JwtTokenVerifier::new("secret");
        let token = issuer.issue("alice/", "proj1").unwrap();

        let claims = verifier.claims(&token).unwrap();
        assert_eq!(claims.developer, "alice/");
        assert!(claims.exp > claims.iat);

        let path = shared_ns("alice/", "proj1").path();
        assert!(verifier.verify(&token, &path).is_ok());

        let other = shared_ns("bob/", "proj1").path();
        assert!(matches!(
            verifier.verify(&token, &other),
            Err(SyncError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_jwt_wrong_secret_rejected() {
        let token = JwtTokenIssuer::new("one", 3600).issue("a/", "p").unwrap();
        let path = shared_ns("a/", "p").path();
        assert!(JwtTokenVerifier::new("two").verify(&token, &path).is_err());
    }

    #[test]
    fn test_issuer_trait_delivers_token() {
        let (tx, rx) = std::sync::mpsc::channel();
        JwtTokenIssuer::new("s", 60).issue_token(
            "a/",
            "p",
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert!(rx.recv().unwrap().is_ok());
    }
}
