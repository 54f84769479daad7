//! Upstream session manager: holds the renewable access token and the
//! credentials used to obtain it.
//!
//! Neither the token nor the credentials ever touch durable storage; both
//! live in process memory from first need to process exit.  Renewals are
//! coalesced: concurrent callers awaiting a renewal share one in-flight
//! attempt rather than issuing a renewal storm.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{Token, UpstreamApi, UpstreamError};

pub struct SessionManager {
    api: Arc<dyn UpstreamApi>,
    token: RwLock<Option<Token>>,
    /// Identity/secret most recently known to work, used for self-renewal.
    credentials: RwLock<Option<(String, String)>>,
    /// Single-flight guard: at most one renewal against the upstream at a
    /// time.  Callers re-check the token after acquiring the lock, so
    /// waiters reuse the winner's result instead of renewing again.
    renew_lock: Mutex<()>,
}

impl SessionManager {
    /// `bootstrap` optionally seeds upstream credentials (from the
    /// environment) so the session can renew from cold before any operator
    /// has called the explicit rotation endpoint.
    pub fn new(api: Arc<dyn UpstreamApi>, bootstrap: Option<(String, String)>) -> Self {
        Self {
            api,
            token: RwLock::new(None),
            credentials: RwLock::new(bootstrap),
            renew_lock: Mutex::new(()),
        }
    }

    /// Current usable token, renewing first when absent or known-expired.
    pub async fn token(&self) -> Result<String, UpstreamError> {
        if let Some(secret) = self.current_valid().await {
            return Ok(secret);
        }

        let _guard = self.renew_lock.lock().await;
        // Another caller may have completed the renewal while we waited.
        if let Some(secret) = self.current_valid().await {
            return Ok(secret);
        }
        self.renew_locked().await
    }

    /// Called by the host lister after the listing endpoint rejected
    /// `rejected`.  If the token has already been replaced by a concurrent
    /// renewal, the replacement is returned without another upstream call.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String, UpstreamError> {
        let _guard = self.renew_lock.lock().await;
        if let Some(secret) = self.current_valid().await {
            if secret != rejected {
                debug!("token already replaced by a concurrent renewal");
                return Ok(secret);
            }
        }
        self.renew_locked().await
    }

    /// Explicit operator-driven rotation with upstream credentials.  On
    /// success both the token and the credentials are retained in memory
    /// for later self-renewal.
    pub async fn renew_with(&self, identity: &str, secret: &str) -> Result<String, UpstreamError> {
        let _guard = self.renew_lock.lock().await;
        let token = self.api.renew_token(identity, secret).await?;
        *self.credentials.write().await = Some((identity.to_string(), secret.to_string()));
        let fresh = token.secret.clone();
        *self.token.write().await = Some(token);
        info!("upstream session token renewed by operator");
        Ok(fresh)
    }

    async fn current_valid(&self) -> Option<String> {
        let guard = self.token.read().await;
        guard
            .as_ref()
            .filter(|t| !t.is_expired(Utc::now()))
            .map(|t| t.secret.clone())
    }

    /// Renew using the stored credentials.  Caller must hold `renew_lock`.
    /// A failure leaves any existing token untouched.
    async fn renew_locked(&self) -> Result<String, UpstreamError> {
        let credentials = self.credentials.read().await.clone();
        let (identity, secret) = credentials.ok_or_else(|| {
            UpstreamError::Auth(
                "no upstream credentials available; renew via the token endpoint".to_string(),
            )
        })?;

        let token = self.api.renew_token(&identity, &secret).await?;
        let fresh = token.secret.clone();
        *self.token.write().await = Some(token);
        info!("upstream session token renewed");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::upstream::HostRecord;

    /// Mock upstream that counts renewals and can be told to fail.
    struct MockApi {
        renewals: AtomicUsize,
        fail_renewal: std::sync::atomic::AtomicBool,
        renew_delay: Duration,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                renewals: AtomicUsize::new(0),
                fail_renewal: std::sync::atomic::AtomicBool::new(false),
                renew_delay: Duration::ZERO,
            }
        }

        fn slow() -> Self {
            Self {
                renew_delay: Duration::from_millis(50),
                ..Self::new()
            }
        }

        fn set_fail(&self, fail: bool) {
            self.fail_renewal.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl UpstreamApi for MockApi {
        async fn renew_token(&self, _: &str, _: &str) -> Result<Token, UpstreamError> {
            tokio::time::sleep(self.renew_delay).await;
            if self.fail_renewal.load(Ordering::SeqCst) {
                return Err(UpstreamError::Auth("bad credentials".into()));
            }
            let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token {
                secret: format!("token-{n}"),
                expires_at: None,
            })
        }

        async fn list_hosts(&self, _: &str) -> Result<Vec<HostRecord>, UpstreamError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_token_renews_lazily_once() {
        let api = Arc::new(MockApi::new());
        let session = SessionManager::new(api.clone(), Some(("id".into(), "pw".into())));

        assert_eq!(session.token().await.unwrap(), "token-1");
        // Second call reuses the stored token.
        assert_eq!(session.token().await.unwrap(), "token-1");
        assert_eq!(api.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_credentials_is_an_auth_failure() {
        let session = SessionManager::new(Arc::new(MockApi::new()), None);
        let err = session.token().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Auth(_)));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_renewal() {
        let api = Arc::new(MockApi::slow());
        let session = Arc::new(SessionManager::new(
            api.clone(),
            Some(("id".into(), "pw".into())),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(api.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_refresh_reuses_concurrent_replacement() {
        let api = Arc::new(MockApi::new());
        let session = SessionManager::new(api.clone(), Some(("id".into(), "pw".into())));

        let first = session.token().await.unwrap();
        // Simulate a rejection of an already-superseded token: refreshing
        // after "stale" should not hit the upstream again.
        let replacement = session.refresh_after_rejection("stale-token").await.unwrap();
        assert_eq!(replacement, first);
        assert_eq!(api.renewals.load(Ordering::SeqCst), 1);

        // Rejecting the current token does renew.
        let renewed = session.refresh_after_rejection(&first).await.unwrap();
        assert_eq!(renewed, "token-2");
        assert_eq!(api.renewals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_existing_token() {
        let api = Arc::new(MockApi::new());
        let session = SessionManager::new(api.clone(), Some(("id".into(), "pw".into())));
        let first = session.token().await.unwrap();

        // A failed operator rotation must not clobber the valid token.
        api.set_fail(true);
        assert!(session.renew_with("id", "wrong").await.is_err());
        assert_eq!(session.token().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_renewal() {
        let api = Arc::new(MockApi::new());
        let session = SessionManager::new(api.clone(), Some(("id".into(), "pw".into())));

        // Install an already-expired token directly.
        *session.token.write().await = Some(Token {
            secret: "expired".to_string(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(10)),
        });

        assert_eq!(session.token().await.unwrap(), "token-1");
        assert_eq!(api.renewals.load(Ordering::SeqCst), 1);
    }
}
