//! Authentication strategies
//!
//! Each strategy extracts credentials from an exchange and verifies them.
//! Missing credentials are distinguished from bad ones so strategies can be
//! stacked: the middleware moves on at `NoCredentials` and stops on
//! `Failure`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::auth::jwt::JwtCodec;
use crate::auth::{AuthResult, Credentials, Principal};
use crate::exchange::Exchange;

/// Verifies username/password pairs against an account store
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    /// Return the principal for valid credentials
    async fn verify(&self, username: &str, password: &str) -> Option<Principal>;
}

/// Validates API keys against a key store
#[async_trait]
pub trait ApiKeyValidator: Send + Sync + 'static {
    /// Return the principal a valid key belongs to
    async fn validate(&self, key: &str) -> Option<Principal>;
}

/// An authentication scheme
#[async_trait]
pub trait AuthStrategy: Send + Sync + 'static {
    /// Scheme name for logs and the `WWW-Authenticate` challenge
    fn scheme(&self) -> &'static str;

    /// Extract credentials from the exchange and verify them
    async fn authenticate(&self, exchange: &Exchange) -> AuthResult;
}

/// `Authorization: Basic` against a [`CredentialVerifier`]
pub struct BasicAuth {
    verifier: Arc<dyn CredentialVerifier>,
}

impl BasicAuth {
    /// Create the strategy over a verifier
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    fn extract(exchange: &Exchange) -> Option<Credentials> {
        let header = exchange.request().header("authorization")?;
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    fn scheme(&self) -> &'static str {
        "Basic"
    }

    async fn authenticate(&self, exchange: &Exchange) -> AuthResult {
        let Some(Credentials::Basic { username, password }) = Self::extract(exchange) else {
            return AuthResult::NoCredentials;
        };

        match self.verifier.verify(&username, &password).await {
            Some(principal) => AuthResult::Success(principal),
            None => AuthResult::Failure("invalid username or password".to_string()),
        }
    }
}

/// `Authorization: Bearer` carrying an HS256 JWT
pub struct BearerAuth {
    codec: JwtCodec,
}

impl BearerAuth {
    /// Create the strategy over a token codec
    pub fn new(codec: JwtCodec) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl AuthStrategy for BearerAuth {
    fn scheme(&self) -> &'static str {
        "Bearer"
    }

    async fn authenticate(&self, exchange: &Exchange) -> AuthResult {
        let Some(header) = exchange.request().header("authorization") else {
            return AuthResult::NoCredentials;
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return AuthResult::NoCredentials;
        };

        match self.codec.verify(token.trim()) {
            Ok(claims) => AuthResult::Success(Principal::from_claims(&claims)),
            Err(e) => AuthResult::Failure(format!("invalid token: {e}")),
        }
    }
}

/// Where an API key is carried
#[derive(Debug, Clone)]
pub enum ApiKeySource {
    /// A request header, e.g. `x-api-key`
    Header(String),
    /// A query parameter
    Query(String),
    /// A cookie
    Cookie(String),
}

/// API key lookup against an [`ApiKeyValidator`]
pub struct ApiKeyAuth {
    source: ApiKeySource,
    validator: Arc<dyn ApiKeyValidator>,
}

impl ApiKeyAuth {
    /// Create the strategy over a key source and validator
    pub fn new(source: ApiKeySource, validator: Arc<dyn ApiKeyValidator>) -> Self {
        Self { source, validator }
    }

    fn extract(&self, exchange: &Exchange) -> Option<String> {
        match &self.source {
            ApiKeySource::Header(name) => {
                exchange.request().header(name).map(str::to_string)
            }
            ApiKeySource::Query(name) => exchange
                .request()
                .query()
                .and_then(|q| query_param(q, name)),
            ApiKeySource::Cookie(name) => exchange.request().cookie(name),
        }
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyAuth {
    fn scheme(&self) -> &'static str {
        "ApiKey"
    }

    async fn authenticate(&self, exchange: &Exchange) -> AuthResult {
        let Some(key) = self.extract(exchange) else {
            return AuthResult::NoCredentials;
        };

        match self.validator.validate(&key).await {
            Some(principal) => AuthResult::Success(principal),
            None => AuthResult::Failure("invalid API key".to_string()),
        }
    }
}

/// Urlencoded login form against a [`CredentialVerifier`]
///
/// Consumes the request body, so it should guard login routes only.
pub struct FormAuth {
    username_field: String,
    password_field: String,
    verifier: Arc<dyn CredentialVerifier>,
}

impl FormAuth {
    /// Create the strategy with the default `username` / `password` fields
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            verifier,
        }
    }

    /// Override the form field names
    #[must_use]
    pub fn with_fields(
        mut self,
        username_field: impl Into<String>,
        password_field: impl Into<String>,
    ) -> Self {
        self.username_field = username_field.into();
        self.password_field = password_field.into();
        self
    }
}

#[async_trait]
impl AuthStrategy for FormAuth {
    fn scheme(&self) -> &'static str {
        "Form"
    }

    async fn authenticate(&self, exchange: &Exchange) -> AuthResult {
        let is_form = exchange
            .request()
            .content_type()
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if !is_form {
            return AuthResult::NoCredentials;
        }

        let Ok(body) = exchange.request().body_bytes().await else {
            return AuthResult::Failure("unreadable form body".to_string());
        };
        let Ok(body) = String::from_utf8(body.to_vec()) else {
            return AuthResult::Failure("form body is not UTF-8".to_string());
        };

        let fields = parse_urlencoded(&body);
        let username = fields
            .iter()
            .find(|(k, _)| k == &self.username_field)
            .map(|(_, v)| v.clone());
        let password = fields
            .iter()
            .find(|(k, _)| k == &self.password_field)
            .map(|(_, v)| v.clone());

        let (Some(username), Some(password)) = (username, password) else {
            return AuthResult::NoCredentials;
        };

        match self.verifier.verify(&username, &password).await {
            Some(principal) => AuthResult::Success(principal),
            None => AuthResult::Failure("invalid username or password".to_string()),
        }
    }
}

/// Decode `application/x-www-form-urlencoded` pairs
pub(crate) fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Some((url_decode(k)?, url_decode(v)?))
        })
        .collect()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    parse_urlencoded(query)
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

fn url_decode(input: &str) -> Option<String> {
    let mut out = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let value = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
                out.push(value);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct FixedVerifier;

    #[async_trait]
    impl CredentialVerifier for FixedVerifier {
        async fn verify(&self, username: &str, password: &str) -> Option<Principal> {
            (username == "admin" && password == "s3cret")
                .then(|| Principal::new("user:admin", "admin"))
        }
    }

    struct FixedKeys;

    #[async_trait]
    impl ApiKeyValidator for FixedKeys {
        async fn validate(&self, key: &str) -> Option<Principal> {
            (key == "key-123").then(|| Principal::new("svc:metrics", "metrics"))
        }
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a+b%21"), Some("a b!".to_string()));
        assert_eq!(url_decode("plain"), Some("plain".to_string()));
        assert_eq!(url_decode("%zz"), None);
        assert_eq!(url_decode("%2"), None);
    }

    #[test]
    fn test_parse_urlencoded() {
        let fields = parse_urlencoded("user=a%40b.com&pass=p+w&flag");
        assert_eq!(
            fields,
            vec![
                ("user".to_string(), "a@b.com".to_string()),
                ("pass".to_string(), "p w".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_basic_auth_success() {
        let strategy = BasicAuth::new(Arc::new(FixedVerifier));
        let (ex, _sink) = testing::exchange(
            http::Request::get("/")
                .header("authorization", format!("Basic {}", BASE64.encode("admin:s3cret")))
                .body(Bytes::new())
                .unwrap(),
        );

        let result = strategy.authenticate(&ex).await;
        assert!(matches!(result, AuthResult::Success(p) if p.id == "user:admin"));
    }

    #[tokio::test]
    async fn test_basic_auth_wrong_password() {
        let strategy = BasicAuth::new(Arc::new(FixedVerifier));
        let (ex, _sink) = testing::exchange(
            http::Request::get("/")
                .header("authorization", format!("Basic {}", BASE64.encode("admin:nope")))
                .body(Bytes::new())
                .unwrap(),
        );

        assert!(matches!(
            strategy.authenticate(&ex).await,
            AuthResult::Failure(_)
        ));
    }

    #[tokio::test]
    async fn test_basic_auth_absent() {
        let strategy = BasicAuth::new(Arc::new(FixedVerifier));
        let (ex, _sink) = testing::get("/");
        assert!(matches!(
            strategy.authenticate(&ex).await,
            AuthResult::NoCredentials
        ));
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let codec = JwtCodec::new("secret", None, std::time::Duration::from_secs(60));
        let mut custom = HashMap::new();
        custom.insert("roles".to_string(), "admin,ops".to_string());
        let token = codec.issue("user:7", custom).unwrap();

        let strategy = BearerAuth::new(codec);
        let (ex, _sink) = testing::exchange(
            http::Request::get("/")
                .header("authorization", format!("Bearer {token}"))
                .body(Bytes::new())
                .unwrap(),
        );

        match strategy.authenticate(&ex).await {
            AuthResult::Success(principal) => {
                assert_eq!(principal.id, "user:7");
                assert!(principal.has_role("admin"));
                assert!(principal.has_role("ops"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_api_key_sources() {
        let validator: Arc<dyn ApiKeyValidator> = Arc::new(FixedKeys);

        let header = ApiKeyAuth::new(ApiKeySource::Header("x-api-key".to_string()), Arc::clone(&validator));
        let (ex, _s) = testing::exchange(
            http::Request::get("/")
                .header("x-api-key", "key-123")
                .body(Bytes::new())
                .unwrap(),
        );
        assert!(matches!(header.authenticate(&ex).await, AuthResult::Success(_)));

        let query = ApiKeyAuth::new(ApiKeySource::Query("api_key".to_string()), Arc::clone(&validator));
        let (ex, _s) = testing::get("/data?api_key=key-123");
        assert!(matches!(query.authenticate(&ex).await, AuthResult::Success(_)));

        let cookie = ApiKeyAuth::new(ApiKeySource::Cookie("api_key".to_string()), Arc::clone(&validator));
        let (ex, _s) = testing::exchange(
            http::Request::get("/")
                .header("cookie", "api_key=key-123")
                .body(Bytes::new())
                .unwrap(),
        );
        assert!(matches!(cookie.authenticate(&ex).await, AuthResult::Success(_)));

        let (ex, _s) = testing::get("/data?api_key=wrong");
        let query = ApiKeyAuth::new(ApiKeySource::Query("api_key".to_string()), validator);
        assert!(matches!(query.authenticate(&ex).await, AuthResult::Failure(_)));
    }

    #[tokio::test]
    async fn test_form_auth() {
        let strategy = FormAuth::new(Arc::new(FixedVerifier));
        let (ex, _sink) = testing::exchange(
            http::Request::post("/login")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Bytes::from("username=admin&password=s3cret"))
                .unwrap(),
        );
        assert!(matches!(
            strategy.authenticate(&ex).await,
            AuthResult::Success(_)
        ));

        // Non-form content type is not this strategy's business
        let strategy = FormAuth::new(Arc::new(FixedVerifier));
        let (ex, _sink) = testing::exchange(
            http::Request::post("/login")
                .header("content-type", "application/json")
                .body(Bytes::from("{}"))
                .unwrap(),
        );
        assert!(matches!(
            strategy.authenticate(&ex).await,
            AuthResult::NoCredentials
        ));
    }
}
