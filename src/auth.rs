//! Administrator credential validation.
//!
//! The server is stateless with respect to admin sessions: the credential
//! travels as a standard Basic authentication header and every privileged
//! request is independently authenticated against the configured pair.
//! Secret comparison is constant-time.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use subtle::ConstantTimeEq;

/// An identity/secret pair presented by a caller.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub identity: String,
    pub secret: String,
}

/// Parse a `Basic` Authorization header.  Returns `None` for a missing or
/// malformed header; malformed input is a rejection, never a crash.
pub fn parse_basic_header(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (identity, secret) = decoded.split_once(':')?;
    Some(BasicCredentials {
        identity: identity.to_string(),
        secret: secret.to_string(),
    })
}

/// The configured administrator capability: a single identity/secret pair
/// read from the environment at startup.
#[derive(Clone)]
pub struct AdminCredentials {
    identity: String,
    secret: String,
}

impl AdminCredentials {
    /// Read the pair from the named environment variables.  `None` when
    /// either is unset or empty, which disables privileged routes.
    pub fn from_env(identity_env: &str, secret_env: &str) -> Option<Self> {
        let identity = std::env::var(identity_env)
            .ok()
            .filter(|v| !v.is_empty())?;
        let secret = std::env::var(secret_env).ok().filter(|v| !v.is_empty())?;
        Some(Self { identity, secret })
    }

    pub fn from_pair(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    /// Constant-time comparison of both identity and secret.
    pub fn verify(&self, presented: &BasicCredentials) -> bool {
        let identity_ok: bool = self
            .identity
            .as_bytes()
            .ct_eq(presented.identity.as_bytes())
            .into();
        let secret_ok: bool = self
            .secret
            .as_bytes()
            .ct_eq(presented.secret.as_bytes())
            .into();
        identity_ok & secret_ok
    }
}

// Keep the secret out of debug output.
impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}
