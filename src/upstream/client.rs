//! reqwest implementation of [`UpstreamApi`] against a proxy-manager
//! control plane.
//!
//! Endpoints:
//! - `POST {base}/api/tokens`             - exchange identity/secret for a token
//! - `GET  {base}/api/nginx/proxy-hosts`  - list proxied hosts (Bearer auth)
//!
//! The base URL is read from the runtime config on every call so that an
//! administrator's config change takes effect without a restart.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;

use super::{HostRecord, Token, UpstreamApi, UpstreamError};

pub struct ProxyManagerApi {
    http: reqwest::Client,
    runtime: Arc<RuntimeConfig>,
}

impl ProxyManagerApi {
    /// Build a client with the configured bounded per-request timeout.
    pub fn new(runtime: Arc<RuntimeConfig>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("proxydash/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { http, runtime })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    /// RFC 3339 expiry bound; the upstream may omit it or send something
    /// unparseable, neither of which should fail the renewal.
    #[serde(default)]
    expires: Option<String>,
}

#[async_trait::async_trait]
impl UpstreamApi for ProxyManagerApi {
    async fn renew_token(&self, identity: &str, secret: &str) -> Result<Token, UpstreamError> {
        let base = self.runtime.base_url().await;
        let url = format!("{base}/api/tokens");

        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "identity": identity, "secret": secret }))
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("token request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!(
                "authentication failed (HTTP {status})"
            )));
        }
        if !status.is_success() {
            warn!(%status, %url, "token endpoint returned non-success");
            return Err(UpstreamError::Unavailable(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("undecodable token response: {e}")))?;

        if body.token.trim().is_empty() {
            return Err(UpstreamError::Unavailable(
                "token response did not contain a token".to_string(),
            ));
        }

        let expires_at = body
            .expires
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        debug!(has_expiry = expires_at.is_some(), "upstream token obtained");
        Ok(Token {
            secret: body.token.trim().to_string(),
            expires_at,
        })
    }

    async fn list_hosts(&self, token: &str) -> Result<Vec<HostRecord>, UpstreamError> {
        let base = self.runtime.base_url().await;
        let url = format!("{base}/api/nginx/proxy-hosts");

        let resp = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("host listing failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(UpstreamError::Auth(
                "host listing rejected the token (HTTP 401)".to_string(),
            ));
        }
        if !status.is_success() {
            warn!(%status, %url, "host listing returned non-success");
            return Err(UpstreamError::Unavailable(format!(
                "host listing returned HTTP {status}"
            )));
        }

        // Strict decode: anything short of a fully well-formed list is a
        // failure, never a silently partial result.
        let hosts: Vec<HostRecord> = resp.json().await.map_err(|e| {
            UpstreamError::Unavailable(format!("undecodable host listing response: {e}"))
        })?;

        debug!(hosts = hosts.len(), "host listing fetched");
        Ok(hosts)
    }
}
