use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::SecurityError;

/// The claims carried by a Depot bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// The user id.
    pub sub: String,
    pub username: String,
    pub is_root: bool,
    /// Expiration as a unix timestamp (seconds).
    pub exp: i64,
}

/// Issues and validates HS256 tokens against a shared secret.
///
/// Tokens are opaque to the client and verifiable by the server alone; there
/// is no revocation list, expiry is the only invalidation.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration: Duration,
}

impl TokenService {
    pub fn new(secret: &str, expiration: Duration) -> Self {
        TokenService {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiration,
        }
    }

    /// Issue a token for `(user_id, username, is_root)`.
    /// Returns the token and its expiration timestamp.
    pub fn issue(
        &self,
        user_id: &str,
        username: &str,
        is_root: bool,
    ) -> Result<(String, i64), SecurityError> {
        let exp = chrono::Utc::now().timestamp() + self.expiration.as_secs() as i64;
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            is_root,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SecurityError::InvalidToken(e.to_string()))?;
        debug!(sub = %user_id, exp, "issued token");
        Ok((token, exp))
    }

    /// Validate signature and expiration; return the claims.
    pub fn validate(&self, token: &str) -> Result<Claims, SecurityError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            let err = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::InvalidToken(e.to_string()),
            };
            warn!(error = %err, "token validation failed");
            err
        })?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issued_tokens_validate() {
        let svc = service();
        let (token, exp) = svc.issue("u1", "alice", false).unwrap();
        let claims = svc.validate(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert!(!claims.is_root);
        assert_eq!(claims.exp, exp);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = service().issue("u1", "alice", false).unwrap();
        let other = TokenService::new("other-secret", Duration::from_secs(3600));
        assert!(matches!(
            other.validate(&token),
            Err(SecurityError::InvalidToken(_))
        ));
    }

    #[test]
    fn expired_tokens_are_a_distinct_error() {
        let svc = TokenService::new("test-secret", Duration::from_secs(0));
        let (token, _) = svc.issue("u1", "alice", false).unwrap();
        // Default leeway is 60s; validate with none to observe expiry now.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret("test-secret".as_bytes()),
            &validation,
        );
        assert!(matches!(
            result.map_err(|e| e.into_kind()),
            Err(jsonwebtoken::errors::ErrorKind::ExpiredSignature)
        ));
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let (token, _) = service().issue("u1", "alice", false).unwrap();
        let tampered = format!("{}x", token);
        assert!(service().validate(&tampered).is_err());
    }

    #[test]
    fn claims_serialize_camel_case() {
        let claims = Claims {
            sub: "u1".into(),
            username: "alice".into(),
            is_root: true,
            exp: 42,
        };
        let v = serde_json::to_value(&claims).unwrap();
        assert!(v.get("isRoot").is_some());
        assert!(v.get("is_root").is_none());
    }
}
