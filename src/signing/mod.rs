pub mod hmac;
pub mod nonce;

pub use hmac::{AuthMethod, LogonAuthenticator, LogonFields, SecretString};
pub use nonce::NonceGenerator;
