use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::persist;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Path of the JSON file holding presentation metadata overrides.
    #[serde(default = "default_meta_file")]
    pub meta_file: PathBuf,
    /// Path of the JSON file holding the admin-mutable runtime settings.
    #[serde(default = "default_runtime_config_file")]
    pub runtime_config_file: PathBuf,
    /// Cross-origin allow-list for the presentation layer.  `"*"` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_meta_file() -> PathBuf {
    PathBuf::from("./proxydash_meta.json")
}

fn default_runtime_config_file() -> PathBuf {
    PathBuf::from("./proxydash_config.json")
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

// ---------------------------------------------------------------------------
// Upstream control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Default base URL of the proxy-manager control plane
    /// (e.g. `http://192.168.1.10:81`).  Admin-mutable at runtime.
    pub base_url: String,
    /// Bounded timeout (seconds) applied to every upstream call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the environment variable holding an optional bootstrap
    /// identity for upstream token renewal.
    #[serde(default = "default_upstream_identity_env")]
    pub identity_env: String,
    /// Name of the environment variable holding the matching secret.
    #[serde(default = "default_upstream_secret_env")]
    pub secret_env: String,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_upstream_identity_env() -> String {
    "UPSTREAM_IDENTITY".to_string()
}

fn default_upstream_secret_env() -> String {
    "UPSTREAM_SECRET".to_string()
}

// ---------------------------------------------------------------------------
// Freshness cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum snapshot age (seconds) before a listing triggers a refresh.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Optional JSON file the last successful snapshot is persisted to, so
    /// the directory stays browsable across restarts while the upstream is
    /// down.
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            snapshot_file: None,
        }
    }
}

fn default_max_age_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Administrator credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Name of the environment variable holding the administrator identity.
    #[serde(default = "default_admin_identity_env")]
    pub identity_env: String,
    /// Name of the environment variable holding the administrator secret.
    #[serde(default = "default_admin_secret_env")]
    pub secret_env: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            identity_env: default_admin_identity_env(),
            secret_env: default_admin_secret_env(),
        }
    }
}

fn default_admin_identity_env() -> String {
    "ADMIN_USER".to_string()
}

fn default_admin_secret_env() -> String {
    "ADMIN_PASS".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.listen.trim().is_empty(), "listen must not be empty");
    anyhow::ensure!(
        config.upstream.timeout_secs > 0,
        "upstream.timeout_secs must be at least 1"
    );
    validate_base_url(&config.upstream.base_url)?;
    Ok(())
}

/// Normalise and validate an upstream base URL: non-empty, http(s) scheme,
/// no trailing slash.
pub fn validate_base_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    anyhow::ensure!(!url.is_empty(), "upstream base URL must not be empty");
    anyhow::ensure!(
        url.starts_with("http://") || url.starts_with("https://"),
        "upstream base URL must start with http:// or https://"
    );
    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Runtime (admin-mutable) settings
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RuntimeConfigFile {
    upstream_base_url: String,
}

/// Runtime settings the administrator can change without a restart.
/// Currently just the upstream base URL.  Changes are persisted to a small
/// JSON file and take effect on the next upstream call.
pub struct RuntimeConfig {
    base_url: RwLock<String>,
    path: PathBuf,
}

impl RuntimeConfig {
    /// Load the persisted runtime settings, falling back to
    /// `default_base_url` when the file is absent or holds a bad value.
    pub fn load(path: PathBuf, default_base_url: &str) -> Result<Self> {
        let default_base_url = validate_base_url(default_base_url)?;

        let base_url = match persist::read_json::<RuntimeConfigFile>(&path) {
            Ok(Some(file)) => match validate_base_url(&file.upstream_base_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %path.display(),
                        "runtime config holds an invalid base URL; using configured default"
                    );
                    default_base_url
                }
            },
            Ok(None) => default_base_url,
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to read runtime config; using configured default"
                );
                default_base_url
            }
        };

        Ok(Self {
            base_url: RwLock::new(base_url),
            path,
        })
    }

    pub async fn base_url(&self) -> String {
        self.base_url.read().await.clone()
    }

    /// Validate, persist, and apply a new upstream base URL.
    pub async fn set_base_url(&self, url: &str) -> Result<String> {
        let url = validate_base_url(url)?;
        persist::write_json_atomic(
            &self.path,
            &RuntimeConfigFile {
                upstream_base_url: url.clone(),
            },
        )?;
        *self.base_url.write().await = url.clone();
        Ok(url)
    }
}
