//! Password hashing using Argon2id
//!
//! The hasher is consumed behind the [`PasswordHasher`] trait so stores can
//! swap implementations; the default uses Argon2id with OWASP-recommended
//! parameters and produces PHC string hashes.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::config::AuthSettings;
use crate::error::{Error, Result};

/// Password hashing collaborator interface
pub trait PasswordHasher: Send + Sync + 'static {
    /// Hash a plaintext password
    fn hash(&self, password: &str) -> Result<String>;

    /// Verify a plaintext password against a stored hash
    fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

/// Argon2id password hasher
#[derive(Clone)]
pub struct Argon2PasswordHasher {
    params: Params,
    min_password_length: usize,
}

impl Default for Argon2PasswordHasher {
    fn default() -> Self {
        Self::from_settings(&AuthSettings::default())
    }
}

impl Argon2PasswordHasher {
    /// Build a hasher from the auth configuration section
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let params = Params::new(
            settings.password_memory_cost_kib,
            settings.password_time_cost,
            settings.password_parallelism,
            None,
        )
        .expect("invalid Argon2 parameters");

        Self {
            params,
            min_password_length: settings.min_password_length,
        }
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl PasswordHasher for Argon2PasswordHasher {
    /// Returns a PHC string hash that embeds algorithm, parameters, and salt
    fn hash(&self, password: &str) -> Result<String> {
        if password.len() < self.min_password_length {
            return Err(Error::ValidationError(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Auth(format!("Failed to hash password: {e}")))?;

        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Auth(format!("Invalid password hash: {e}")))?;

        Ok(self
            .argon2()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}
