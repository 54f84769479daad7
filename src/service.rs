//! Directory service: the privileged entry points and the listing pipeline.
//!
//! Everything the presentation layer can do goes through here.  The service
//! owns no state of its own; it composes the freshness cache, the override
//! store, the upstream session, and the runtime config, and enforces the
//! authorization rules on every call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{AdminCredentials, BasicCredentials};
use crate::cache::{FreshnessCache, Source};
use crate::config::RuntimeConfig;
use crate::error::ApiError;
use crate::merge::{merge_link, merge_links, LinkView};
use crate::store::{MetaPatch, MetaStore};
use crate::upstream::session::SessionManager;
use crate::upstream::UpstreamError;

const MAX_NAME_LEN: usize = 120;
const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_EMOJI_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// A merged listing plus its provenance.
#[derive(Debug)]
pub struct Listing {
    pub links: Vec<LinkView>,
    pub source: Source,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub upstream_base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default)]
    pub upstream_base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub identity: String,
    pub secret: String,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct DirectoryService {
    cache: FreshnessCache,
    store: Arc<MetaStore>,
    session: Arc<SessionManager>,
    runtime: Arc<RuntimeConfig>,
    /// `None` when the deployment has no admin pair configured, which keeps
    /// every privileged route answering 503 rather than quietly open.
    admin: Option<AdminCredentials>,
}

impl DirectoryService {
    pub fn new(
        cache: FreshnessCache,
        store: Arc<MetaStore>,
        session: Arc<SessionManager>,
        runtime: Arc<RuntimeConfig>,
        admin: Option<AdminCredentials>,
    ) -> Self {
        Self {
            cache,
            store,
            session,
            runtime,
            admin,
        }
    }

    fn require_admin(&self, presented: Option<&BasicCredentials>) -> Result<(), ApiError> {
        let admin = self.admin.as_ref().ok_or_else(|| {
            ApiError::AuthUnconfigured(
                "no administrator credentials configured on this deployment".to_string(),
            )
        })?;
        match presented {
            Some(credentials) if admin.verify(credentials) => Ok(()),
            Some(_) => Err(ApiError::AuthRejected("invalid credentials".to_string())),
            None => Err(ApiError::AuthRejected("credentials required".to_string())),
        }
    }

    /// List merged links.  Hidden entries are only included for an
    /// authenticated administrator who asked for them.
    pub async fn list_links(
        &self,
        include_hidden: bool,
        credential: Option<&BasicCredentials>,
    ) -> Result<Listing, ApiError> {
        if include_hidden {
            self.require_admin(credential)?;
        }

        let snapshot = self.cache.snapshot(false).await?;
        let overrides = self.store.overrides().await;
        let links = merge_links(&snapshot.hosts, &overrides, include_hidden);

        Ok(Listing {
            links,
            source: snapshot.source,
            fetched_at: snapshot.fetched_at,
        })
    }

    /// Upsert the override for `id` and return the freshly merged view.
    /// Rejects ids unknown to the current snapshot so overrides cannot
    /// accumulate for hosts that were never observed.
    pub async fn patch_link_meta(
        &self,
        id: u64,
        patch: &MetaPatch,
        credential: Option<&BasicCredentials>,
    ) -> Result<LinkView, ApiError> {
        self.require_admin(credential)?;
        validate_patch(patch)?;

        let snapshot = self.cache.snapshot(false).await?;
        let host = snapshot
            .hosts
            .iter()
            .find(|h| h.id == id)
            .ok_or_else(|| ApiError::NotFound(format!("no proxied host with id {id}")))?;

        let meta = self.store.apply_patch(id, patch).await?;
        info!(id, "link metadata patched");
        Ok(merge_link(host, meta.as_ref()))
    }

    /// Delete the override for `id`.  Idempotent, and valid even for ids no
    /// longer present upstream so stale overrides stay removable.
    pub async fn delete_link_meta(
        &self,
        id: u64,
        credential: Option<&BasicCredentials>,
    ) -> Result<(), ApiError> {
        self.require_admin(credential)?;
        self.store.delete(id).await?;
        info!(id, "link metadata deleted");
        Ok(())
    }

    pub async fn get_config(
        &self,
        credential: Option<&BasicCredentials>,
    ) -> Result<ConfigView, ApiError> {
        self.require_admin(credential)?;
        Ok(ConfigView {
            upstream_base_url: self.runtime.base_url().await,
        })
    }

    pub async fn set_config(
        &self,
        patch: &ConfigPatch,
        credential: Option<&BasicCredentials>,
    ) -> Result<ConfigView, ApiError> {
        self.require_admin(credential)?;

        if let Some(url) = &patch.upstream_base_url {
            let applied = self
                .runtime
                .set_base_url(url)
                .await
                .map_err(|e| ApiError::Validation(e.to_string()))?;
            info!(base_url = %applied, "upstream base URL updated");
        }

        Ok(ConfigView {
            upstream_base_url: self.runtime.base_url().await,
        })
    }

    /// Renew the upstream session token with operator-supplied upstream
    /// credentials.  Authenticates against the upstream itself, not the
    /// administrator pair.  On success a background refresh warms the cache
    /// with the new token.
    pub async fn renew_upstream_token(&self, request: &RenewRequest) -> Result<String, ApiError> {
        let token = self
            .session
            .renew_with(&request.identity, &request.secret)
            .await
            .map_err(|e| match e {
                UpstreamError::Auth(detail) => ApiError::UpstreamAuthFailure(detail),
                UpstreamError::Unavailable(detail) => ApiError::UpstreamUnavailable(detail),
            })?;

        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.snapshot(true).await {
                warn!(error = %e, "post-renewal cache warm-up failed");
            }
        });

        Ok(token)
    }
}

fn validate_patch(patch: &MetaPatch) -> Result<(), ApiError> {
    check_len(&patch.name, MAX_NAME_LEN, "name")?;
    check_len(&patch.description, MAX_DESCRIPTION_LEN, "description")?;
    check_len(&patch.emoji, MAX_EMOJI_LEN, "emoji")?;
    Ok(())
}

fn check_len(
    field: &Option<Option<String>>,
    max: usize,
    label: &str,
) -> Result<(), ApiError> {
    if let Some(Some(value)) = field {
        if value.chars().count() > max {
            return Err(ApiError::Validation(format!(
                "{label} exceeds the maximum length of {max} characters"
            )));
        }
    }
    Ok(())
}
