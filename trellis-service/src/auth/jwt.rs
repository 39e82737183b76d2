//! HS256 JWT issuing and verification
//!
//! Tokens carry the standard `sub` / `iat` / `exp` claims, an optional
//! `iss`, and string-typed custom claims. Verification rejects malformed
//! tokens, any algorithm other than HS256, signature mismatches, issuer
//! mismatches when an issuer is configured, and expired tokens.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthSettings;
use crate::error::Result;

/// JWT payload claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (required)
    pub sub: String,

    /// Issued-at, seconds since epoch
    pub iat: i64,

    /// Expiry, seconds since epoch
    pub exp: i64,

    /// Issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// String-typed custom claims
    #[serde(flatten)]
    pub custom: HashMap<String, String>,
}

impl Claims {
    /// Look up a custom claim
    pub fn custom(&self, name: &str) -> Option<&str> {
        self.custom.get(name).map(String::as_str)
    }
}

/// Symmetric HS256 token codec
#[derive(Clone)]
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: Option<String>,
    ttl: Duration,
}

impl JwtCodec {
    /// Create a codec over a shared secret
    pub fn new(secret: &str, issuer: Option<String>, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            ttl,
        }
    }

    /// Build a codec from the auth configuration section
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            &settings.jwt_secret,
            settings.jwt_issuer.clone(),
            Duration::from_secs(settings.token_ttl_secs),
        )
    }

    /// Issue a token for `sub` with the default lifetime
    pub fn issue(&self, sub: &str, custom: HashMap<String, String>) -> Result<String> {
        self.issue_with_ttl(sub, custom, self.ttl)
    }

    /// Issue a token with an explicit lifetime
    pub fn issue_with_ttl(
        &self,
        sub: &str,
        custom: HashMap<String, String>,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            iss: self.issuer.clone(),
            custom,
        };

        let header = Header::new(Algorithm::HS256);
        Ok(encode(&header, &claims, &self.encoding)?)
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> JwtCodec {
        JwtCodec::new("test-secret", None, Duration::from_secs(600))
    }

    #[test]
    fn test_issue_and_verify() {
        let codec = codec();
        let mut custom = HashMap::new();
        custom.insert("tenant".to_string(), "acme".to_string());

        let token = codec.issue("user:1", custom).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.sub, "user:1");
        assert_eq!(claims.custom("tenant"), Some("acme"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let token = codec().issue("user:1", HashMap::new()).unwrap();
        let other = JwtCodec::new("different-secret", None, Duration::from_secs(600));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(codec().verify("not-a-token").is_err());
        assert!(codec().verify("a.b").is_err());
    }

    #[test]
    fn test_rejects_expired() {
        let codec = codec();
        let token = codec
            .issue_with_ttl("user:1", HashMap::new(), Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(1_100));
        assert!(codec.verify(&token).is_err());
    }

    #[test]
    fn test_issuer_mismatch() {
        let issuing = JwtCodec::new("s", Some("auth.acme".to_string()), Duration::from_secs(600));
        let expecting_other =
            JwtCodec::new("s", Some("auth.other".to_string()), Duration::from_secs(600));

        let token = issuing.issue("user:1", HashMap::new()).unwrap();
        assert!(issuing.verify(&token).is_ok());
        assert!(expecting_other.verify(&token).is_err());
    }

    #[test]
    fn test_verifier_without_issuer_accepts_any() {
        let issuing = JwtCodec::new("s", Some("auth.acme".to_string()), Duration::from_secs(600));
        let lax = JwtCodec::new("s", None, Duration::from_secs(600));

        let token = issuing.issue("user:1", HashMap::new()).unwrap();
        let claims = lax.verify(&token).unwrap();
        assert_eq!(claims.iss.as_deref(), Some("auth.acme"));
    }

    #[test]
    fn test_rejects_non_hs256() {
        // Token signed with none-style header: three parts, alg "none"
        let header = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0";
        let payload = "eyJzdWIiOiJ1c2VyOjEiLCJleHAiOjk5OTk5OTk5OTl9";
        let token = format!("{header}.{payload}.");
        assert!(codec().verify(&token).is_err());
    }
}
