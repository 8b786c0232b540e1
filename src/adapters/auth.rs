use async_trait::async_trait;
use http::{HeaderMap, header};

use crate::{
    config::models::{AuthConfig, AuthMode},
    ports::auth::{AuthDecision, Authenticator},
};

/// Static bearer-token authenticator backed by the token table in the
/// gateway configuration. Tokens are presented as `Authorization: Bearer
/// <token>`; each known token carries an identity and an authorization flag.
pub struct BearerTokenAuthenticator {
    config: AuthConfig,
}

impl BearerTokenAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn bearer_token(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[async_trait]
impl Authenticator for BearerTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap, mode: AuthMode) -> AuthDecision {
        if mode == AuthMode::None {
            return AuthDecision {
                valid: true,
                authorized: true,
                identity: None,
            };
        }

        let Some(token) = Self::bearer_token(headers) else {
            return AuthDecision {
                valid: false,
                authorized: false,
                identity: None,
            };
        };

        match self.config.tokens.get(token) {
            Some(grant) => AuthDecision {
                valid: true,
                authorized: grant.authorized,
                identity: Some(grant.identity.clone()),
            },
            None => AuthDecision {
                valid: false,
                authorized: false,
                identity: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http::HeaderValue;

    use super::*;
    use crate::config::models::TokenGrant;

    fn authenticator() -> BearerTokenAuthenticator {
        let mut tokens = HashMap::new();
        tokens.insert(
            "good-token".to_string(),
            TokenGrant {
                identity: "svc-orders".to_string(),
                authorized: true,
            },
        );
        tokens.insert(
            "known-but-unauthorized".to_string(),
            TokenGrant {
                identity: "svc-probe".to_string(),
                authorized: false,
            },
        );
        BearerTokenAuthenticator::new(AuthConfig { tokens })
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn known_token_yields_identity_and_grant() {
        let decision = authenticator()
            .authenticate(&headers_with("good-token"), AuthMode::VerifyAndAuthorize)
            .await;
        assert!(decision.valid);
        assert!(decision.authorized);
        assert_eq!(decision.identity.as_deref(), Some("svc-orders"));
    }

    #[tokio::test]
    async fn valid_token_may_still_lack_authorization() {
        let decision = authenticator()
            .authenticate(
                &headers_with("known-but-unauthorized"),
                AuthMode::VerifyAndAuthorize,
            )
            .await;
        assert!(decision.valid);
        assert!(!decision.authorized);
    }

    #[tokio::test]
    async fn unknown_or_missing_token_is_invalid() {
        let auth = authenticator();
        let decision = auth
            .authenticate(&headers_with("bogus"), AuthMode::VerifyOnly)
            .await;
        assert!(!decision.valid);

        let decision = auth
            .authenticate(&HeaderMap::new(), AuthMode::VerifyOnly)
            .await;
        assert!(!decision.valid);
    }

    #[tokio::test]
    async fn mode_none_skips_the_token_table() {
        let decision = authenticator()
            .authenticate(&HeaderMap::new(), AuthMode::None)
            .await;
        assert!(decision.valid);
        assert!(decision.authorized);
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(BearerTokenAuthenticator::bearer_token(&headers).is_none());
        assert_eq!(
            BearerTokenAuthenticator::bearer_token(&headers_with("abc")),
            Some("abc")
        );
    }
}
