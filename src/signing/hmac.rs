use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::nonce::NonceGenerator;
use crate::error::{FixflowError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Secret that is wiped from memory on drop and never printed
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// How the logon proves the account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Plaintext username/password tags
    #[default]
    Password,
    /// Nonce plus base64 HMAC-SHA256 digest in place of the password
    HmacSha256,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::HmacSha256 => write!(f, "hmac_sha256"),
        }
    }
}

/// Credential fields to place on an outbound logon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonFields {
    pub username: String,
    /// Plain password, or the encoded digest in hmac mode
    pub password: String,
    /// Nonce (hmac mode only)
    pub raw_data: Option<String>,
}

/// Builds logon credentials for the configured auth method
pub struct LogonAuthenticator {
    method: AuthMethod,
    username: String,
    secret: SecretString,
    nonces: NonceGenerator,
}

impl LogonAuthenticator {
    pub fn new(method: AuthMethod, username: impl Into<String>, secret: SecretString) -> Self {
        Self {
            method,
            username: username.into(),
            secret,
            nonces: NonceGenerator::new(),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// base64(HMAC-SHA256(secret, nonce))
    pub fn sign(&self, nonce: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
            .map_err(|e| FixflowError::Auth(format!("HMAC init failed: {}", e)))?;

        mac.update(nonce.as_bytes());
        let result = mac.finalize();

        Ok(BASE64.encode(result.into_bytes()))
    }

    /// Fields for the next logon. Each call in hmac mode uses a new nonce.
    pub fn logon_fields(&self) -> Result<LogonFields> {
        if self.username.is_empty() {
            return Err(FixflowError::Auth("username is not configured".to_string()));
        }

        match self.method {
            AuthMethod::Password => Ok(LogonFields {
                username: self.username.clone(),
                password: self.secret.expose().to_string(),
                raw_data: None,
            }),
            AuthMethod::HmacSha256 => {
                if self.secret.is_empty() {
                    return Err(FixflowError::Auth("hmac secret is not configured".to_string()));
                }
                let nonce = self.nonces.next()?;
                let digest = self.sign(&nonce)?;
                Ok(LogonFields {
                    username: self.username.clone(),
                    password: digest,
                    raw_data: Some(nonce),
                })
            }
        }
    }
}

impl fmt::Debug for LogonAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogonAuthenticator")
            .field("method", &self.method)
            .field("username", &self.username)
            .finish()
    }
}
