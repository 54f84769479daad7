//! Upstream control-plane types and the API seam.
//!
//! The [`UpstreamApi`] trait encapsulates all control-plane interaction
//! (token renewal and host listing).  Callers in the session, lister, and
//! cache layers dispatch through this trait so that no endpoint URL
//! construction or response parsing leaks outside this module, and tests
//! can substitute a mock.

pub mod client;
pub mod lister;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Host records
// ---------------------------------------------------------------------------

/// One proxied host as reported by the upstream control plane.  Authoritative
/// and immutable from this system's perspective; the whole set is replaced
/// wholesale on each successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Opaque stable identity assigned by the control plane.
    pub id: u64,
    /// Ordered domain names served by this host.
    pub domain_names: Vec<String>,
    #[serde(default)]
    pub forward_host: Option<String>,
    #[serde(default)]
    pub forward_port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Session token
// ---------------------------------------------------------------------------

/// A renewable upstream access token.  Held in process memory only.
#[derive(Debug, Clone)]
pub struct Token {
    pub secret: String,
    /// Known-valid lifetime bound, when the upstream provides one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(bound) => bound <= now,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Typed failures
// ---------------------------------------------------------------------------

/// Failure of an upstream call, returned as a value rather than raised past
/// the upstream layer's boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// The upstream rejected the presented token or credentials.
    #[error("upstream rejected credentials: {0}")]
    Auth(String),
    /// Network failure, non-2xx status, or an undecodable response.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the upstream control plane's administrative API.
#[async_trait::async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Exchange an identity/secret pair for a fresh access token.
    async fn renew_token(&self, identity: &str, secret: &str) -> Result<Token, UpstreamError>;

    /// Retrieve the current list of proxied hosts.  A partially decodable
    /// response is a failure, never a partial list.
    async fn list_hosts(&self, token: &str) -> Result<Vec<HostRecord>, UpstreamError>;
}
