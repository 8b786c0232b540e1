use async_trait::async_trait;
use http::HeaderMap;

use crate::config::models::AuthMode;

/// Verdict of the auth collaborator for one request.
#[derive(Debug, Clone, Default)]
pub struct AuthDecision {
    /// The presented credential is recognised and intact.
    pub valid: bool,
    /// The credential carries the grant required by the route.
    pub authorized: bool,
    /// Identity attached to the request span when present.
    pub identity: Option<String>,
}

impl AuthDecision {
    /// Whether this decision satisfies the given route requirement.
    /// `VerifyAndAuthorize` needs validity and authorization, `VerifyOnly`
    /// needs validity alone, `None` always passes.
    pub fn satisfies(&self, mode: AuthMode) -> bool {
        match mode {
            AuthMode::None => true,
            AuthMode::VerifyAndAuthorize => self.valid && self.authorized,
            AuthMode::VerifyOnly => self.valid,
        }
    }
}

/// Authenticator is the port for the external auth collaborator. The
/// dispatcher calls it only for routes whose auth mode is not `None`.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, headers: &HeaderMap, mode: AuthMode) -> AuthDecision;
}
