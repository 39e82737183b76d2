//! Authentication: credentials, principals, strategies, and middleware

mod jwt;
mod password;
mod strategy;

pub use jwt::{Claims, JwtCodec};
pub use password::{Argon2PasswordHasher, PasswordHasher};
pub use strategy::{
    ApiKeyAuth, ApiKeySource, ApiKeyValidator, AuthStrategy, BasicAuth, BearerAuth,
    CredentialVerifier, FormAuth,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use crate::error::Result;
use crate::exchange::{AttrKey, Exchange};
use crate::pipeline::{Middleware, Next};

/// Attribute key under which the authenticated principal is stored
pub const PRINCIPAL: AttrKey<Principal> = AttrKey::new("trellis.principal");

/// Credentials extracted from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// HTTP Basic pair
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token
    Bearer {
        /// The raw token
        token: String,
    },
    /// Opaque API key
    ApiKey {
        /// The key value
        key: String,
    },
    /// Login form pair
    UsernamePassword {
        /// Username
        username: String,
        /// Password
        password: String,
    },
}

/// Outcome of an authentication attempt
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// Credentials verified
    Success(Principal),
    /// Credentials present but invalid
    Failure(String),
    /// The strategy found no credentials to check
    NoCredentials,
}

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable identity, e.g. `user:42`
    pub id: String,
    /// Display name
    pub name: String,
    /// Granted roles
    pub roles: Vec<String>,
    /// Granted permissions
    pub permissions: Vec<String>,
    /// Arbitrary string claims
    pub claims: HashMap<String, String>,
}

impl Principal {
    /// Create a principal with no roles or permissions
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: Vec::new(),
            permissions: Vec::new(),
            claims: HashMap::new(),
        }
    }

    /// Attach roles
    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Attach permissions
    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// True when the principal holds `role`
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True when the principal holds `permission`
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Build a principal from verified JWT claims
    ///
    /// `roles` and `perms` custom claims are comma-separated lists; every
    /// custom claim is kept on the principal.
    #[must_use]
    pub fn from_claims(claims: &Claims) -> Self {
        let split = |name: &str| -> Vec<String> {
            claims
                .custom(name)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            id: claims.sub.clone(),
            name: claims
                .custom("name")
                .unwrap_or(claims.sub.as_str())
                .to_string(),
            roles: split("roles"),
            permissions: split("perms"),
            claims: claims.custom.clone(),
        }
    }
}

/// Pipeline middleware running a stack of [`AuthStrategy`]s
///
/// Strategies run in order. The first `Success` attaches the principal under
/// [`PRINCIPAL`] and continues; a `Failure` short-circuits with 401; when
/// every strategy reports `NoCredentials` the request continues anonymously
/// unless the middleware is `required`.
pub struct AuthMiddleware {
    strategies: Vec<Arc<dyn AuthStrategy>>,
    required: bool,
}

impl AuthMiddleware {
    /// Create an empty, optional middleware
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            required: false,
        }
    }

    /// Append a strategy
    #[must_use]
    pub fn strategy(mut self, strategy: impl AuthStrategy) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// Reject requests that present no credentials at all
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn challenge(&self) -> String {
        let schemes: Vec<&str> = self.strategies.iter().map(|s| s.scheme()).collect();
        if schemes.is_empty() {
            "Bearer".to_string()
        } else {
            schemes.join(", ")
        }
    }

    async fn reject(&self, exchange: &Exchange, message: &str) -> Result<()> {
        let response = exchange.response();
        if !response.committed() {
            response.insert_header("www-authenticate", &self.challenge())?;
            response
                .send_text(StatusCode::UNAUTHORIZED, message.to_string())
                .await?;
        }
        Ok(())
    }
}

impl Default for AuthMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(&self, exchange: Arc<Exchange>, next: Next) -> Result<()> {
        for strategy in &self.strategies {
            match strategy.authenticate(&exchange).await {
                AuthResult::Success(principal) => {
                    tracing::debug!(
                        principal = %principal.id,
                        scheme = strategy.scheme(),
                        "request authenticated"
                    );
                    exchange.attributes().insert(PRINCIPAL, principal);
                    return next.run(exchange).await;
                }
                AuthResult::Failure(message) => {
                    tracing::debug!(scheme = strategy.scheme(), %message, "authentication failed");
                    return self.reject(&exchange, "authentication failed").await;
                }
                AuthResult::NoCredentials => {}
            }
        }

        if self.required {
            return self.reject(&exchange, "authentication required").await;
        }
        next.run(exchange).await
    }
}
