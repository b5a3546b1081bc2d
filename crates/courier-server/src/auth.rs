//! Upgrade-time authentication and origin checks.

use crate::config::AuthSettings;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use courier_core::{Authenticator, CallerId, CollaboratorError, Credentials};
use std::collections::HashMap;

/// Header a trusted proxy uses to assert the caller id.
pub const FORWARDED_USER_HEADER: &str = "x-user-id";

/// Resolves static bearer tokens, and optionally a proxy-asserted caller id.
pub struct StaticAuthenticator {
    tokens: HashMap<String, CallerId>,
    trust_forwarded_user: bool,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            tokens: settings
                .tokens
                .iter()
                .map(|(token, caller)| (token.clone(), CallerId::from(caller.as_str())))
                .collect(),
            trust_forwarded_user: settings.trust_forwarded_user,
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<CallerId, CollaboratorError> {
        if let Some(token) = &credentials.token {
            return self
                .tokens
                .get(token)
                .cloned()
                .ok_or(CollaboratorError::InvalidCredentials);
        }
        match &credentials.forwarded_user {
            Some(user) if self.trust_forwarded_user && !user.is_empty() => {
                Ok(CallerId::from(user.as_str()))
            }
            _ => Err(CollaboratorError::InvalidCredentials),
        }
    }
}

/// Collect credentials from the upgrade request.
///
/// The bearer token comes from `Authorization`, falling back to the `token`
/// query parameter for browsers that cannot set headers on upgrade.
#[must_use]
pub fn credentials(headers: &HeaderMap, query: &HashMap<String, String>) -> Credentials {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
        .filter(|t| !t.is_empty());
    let forwarded_user = headers
        .get(FORWARDED_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Credentials {
        token,
        forwarded_user,
    }
}

/// Whether the request origin is on the allow-list. A missing origin is
/// never allowed.
#[must_use]
pub fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    allowed.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn settings() -> AuthSettings {
        AuthSettings {
            trust_forwarded_user: true,
            tokens: HashMap::from([("secret".to_string(), "u1".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_token_lookup() {
        let auth = StaticAuthenticator::new(&settings());
        let creds = Credentials {
            token: Some("secret".into()),
            forwarded_user: None,
        };
        assert_eq!(auth.authenticate(&creds).await.unwrap().as_str(), "u1");

        let bad = Credentials {
            token: Some("nope".into()),
            // A bad token is not rescued by the forwarded header
            forwarded_user: Some("u9".into()),
        };
        assert_eq!(
            auth.authenticate(&bad).await,
            Err(CollaboratorError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_forwarded_user_requires_trust() {
        let creds = Credentials {
            token: None,
            forwarded_user: Some("u7".into()),
        };
        let trusted = StaticAuthenticator::new(&settings());
        assert_eq!(trusted.authenticate(&creds).await.unwrap().as_str(), "u7");

        let untrusted = StaticAuthenticator::new(&AuthSettings::default());
        assert!(untrusted.authenticate(&creds).await.is_err());
        assert!(trusted.authenticate(&Credentials::default()).await.is_err());
    }

    #[test]
    fn test_credentials_from_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(FORWARDED_USER_HEADER, HeaderValue::from_static("u1"));
        let creds = credentials(&headers, &HashMap::new());
        assert_eq!(creds.token.as_deref(), Some("abc"));
        assert_eq!(creds.forwarded_user.as_deref(), Some("u1"));

        let query = HashMap::from([("token".to_string(), "q".to_string())]);
        let creds = credentials(&HeaderMap::new(), &query);
        assert_eq!(creds.token.as_deref(), Some("q"));
        assert!(creds.forwarded_user.is_none());
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["https://app.example.com".to_string()];
        let mut headers = HeaderMap::new();
        assert!(!origin_allowed(&allowed, &headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example.com"));
        assert!(!origin_allowed(&allowed, &headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        assert!(origin_allowed(&allowed, &headers));

        assert!(origin_allowed(&["*".to_string()], &headers));
        assert!(!origin_allowed(&["*".to_string()], &HeaderMap::new()));
    }
}
