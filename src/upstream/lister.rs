//! Upstream host lister: fetches the authoritative host list with exactly
//! one renew-and-retry on an authentication rejection.
//!
//! Any other failure returns immediately as a typed value.  Retry and
//! backoff scheduling beyond the single auth retry belongs to the freshness
//! cache, not here.

use std::sync::Arc;

use tracing::debug;

use super::session::SessionManager;
use super::{HostRecord, UpstreamApi, UpstreamError};

#[derive(Clone)]
pub struct HostLister {
    api: Arc<dyn UpstreamApi>,
    session: Arc<SessionManager>,
}

impl HostLister {
    pub fn new(api: Arc<dyn UpstreamApi>, session: Arc<SessionManager>) -> Self {
        Self { api, session }
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>, UpstreamError> {
        let token = self.session.token().await?;

        match self.api.list_hosts(&token).await {
            Ok(hosts) => Ok(hosts),
            Err(UpstreamError::Auth(reason)) => {
                debug!(%reason, "host listing rejected the token; renewing and retrying once");
                let fresh = self.session.refresh_after_rejection(&token).await?;
                self.api.list_hosts(&fresh).await
            }
            Err(e) => Err(e),
        }
    }
}
