//! Locally owned presentation metadata, keyed by upstream host identity.
//!
//! Overrides are the only state this service owns outright.  They survive
//! restarts through an atomically rewritten JSON file and take precedence,
//! field by field, over upstream defaults at merge time.  An override with
//! every field at its default says nothing the absence of an override would
//! not, so such entries are pruned on write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::persist;

// ---------------------------------------------------------------------------
// Override record
// ---------------------------------------------------------------------------

/// Presentation overrides for one host.  Every field is optional; `None`
/// (or `false` for `hidden`) defers to the upstream-derived default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl MetaOverride {
    /// True when the record is indistinguishable from no override at all.
    pub fn is_default(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.emoji.is_none() && !self.hidden
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A partial update.  Each field is tri-state: absent leaves the stored
/// value unchanged, an explicit `null` (or blank string) clears it to the
/// default, and a value replaces it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaPatch {
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub emoji: Option<Option<String>>,
    #[serde(default)]
    pub hidden: Option<bool>,
}

/// Distinguish an absent field from an explicit `null`: `#[serde(default)]`
/// covers absence, and this runs only when the key is present.
fn double_option<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl MetaPatch {
    fn apply(&self, current: &mut MetaOverride) {
        apply_field(&self.name, &mut current.name);
        apply_field(&self.description, &mut current.description);
        apply_field(&self.emoji, &mut current.emoji);
        if let Some(hidden) = self.hidden {
            current.hidden = hidden;
        }
    }
}

fn apply_field(patch: &Option<Option<String>>, target: &mut Option<String>) {
    match patch {
        None => {}
        Some(None) => *target = None,
        Some(Some(value)) => {
            let trimmed = value.trim();
            // A blank string clears the same as an explicit null.
            *target = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct MetaStore {
    path: PathBuf,
    entries: Mutex<HashMap<u64, MetaOverride>>,
}

impl MetaStore {
    /// Load the store from `path`.  A missing file starts empty; a corrupt
    /// file is an error so a broken deploy fails loudly instead of silently
    /// discarding operator data.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let entries: HashMap<u64, MetaOverride> = persist::read_json(path)
            .with_context(|| format!("failed to load override store from {}", path.display()))?
            .unwrap_or_default();
        info!(overrides = entries.len(), path = %path.display(), "override store loaded");
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }))
    }

    pub async fn get(&self, id: u64) -> Option<MetaOverride> {
        self.entries.lock().await.get(&id).cloned()
    }

    /// Apply `patch` to the override for `id`, creating it if absent, and
    /// persist the result.  Returns the effective override after the patch,
    /// `None` meaning everything reverted to defaults.
    pub async fn apply_patch(&self, id: u64, patch: &MetaPatch) -> Result<Option<MetaOverride>> {
        let mut entries = self.entries.lock().await;
        let mut current = entries.get(&id).cloned().unwrap_or_default();
        patch.apply(&mut current);

        let result = if current.is_default() {
            entries.remove(&id);
            None
        } else {
            entries.insert(id, current.clone());
            Some(current)
        };

        self.persist(&entries)?;
        debug!(id, pruned = result.is_none(), "override patched");
        Ok(result)
    }

    /// Remove the override for `id` entirely.  Idempotent: deleting an
    /// absent override persists nothing and is not an error.
    pub async fn delete(&self, id: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&id).is_some() {
            self.persist(&entries)?;
            debug!(id, "override deleted");
        }
        Ok(())
    }

    /// Snapshot of every stored override, for the merge pass.
    pub async fn overrides(&self) -> HashMap<u64, MetaOverride> {
        self.entries.lock().await.clone()
    }

    fn persist(&self, entries: &HashMap<u64, MetaOverride>) -> Result<()> {
        persist::write_json_atomic(&self.path, entries)
            .with_context(|| format!("failed to persist override store to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> Arc<MetaStore> {
        MetaStore::load(&dir.path().join("meta.json")).unwrap()
    }

    fn patch(json: &str) -> MetaPatch {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_patch_tri_state_deserialization() {
        let p = patch(r#"{"name": "App", "description": null}"#);
        assert_eq!(p.name, Some(Some("App".to_string())));
        assert_eq!(p.description, Some(None));
        assert_eq!(p.emoji, None);
        assert_eq!(p.hidden, None);
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let result: std::result::Result<MetaPatch, _> =
            serde_json::from_str(r#"{"nmae": "typo"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_patch_sets_and_absent_fields_stay() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .apply_patch(1, &patch(r#"{"name": "App A", "hidden": true}"#))
            .await
            .unwrap();
        let updated = store
            .apply_patch(1, &patch(r#"{"description": "internal tool"}"#))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.name.as_deref(), Some("App A"));
        assert_eq!(updated.description.as_deref(), Some("internal tool"));
        assert!(updated.hidden);
    }

    #[tokio::test]
    async fn test_null_and_blank_both_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .apply_patch(1, &patch(r#"{"name": "App", "emoji": "X", "hidden": true}"#))
            .await
            .unwrap();
        let updated = store
            .apply_patch(1, &patch(r#"{"name": null, "emoji": "  "}"#))
            .await
            .unwrap()
            .unwrap();

        assert!(updated.name.is_none());
        assert!(updated.emoji.is_none());
        assert!(updated.hidden);
    }

    #[tokio::test]
    async fn test_patch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let p = patch(r#"{"name": "App A", "hidden": true}"#);
        let once = store.apply_patch(1, &p).await.unwrap();
        let twice = store.apply_patch(1, &p).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_all_default_override_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .apply_patch(1, &patch(r#"{"name": "App", "hidden": true}"#))
            .await
            .unwrap();
        let result = store
            .apply_patch(1, &patch(r#"{"name": null, "hidden": false}"#))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(store.get(1).await.is_none());
        assert!(store.overrides().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .apply_patch(7, &patch(r#"{"name": "Gone"}"#))
            .await
            .unwrap();
        store.delete(7).await.unwrap();
        store.delete(7).await.unwrap();
        assert!(store.get(7).await.is_none());
    }

    #[tokio::test]
    async fn test_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        {
            let store = MetaStore::load(&path).unwrap();
            store
                .apply_patch(3, &patch(r#"{"name": "Persisted", "hidden": true}"#))
                .await
                .unwrap();
        }

        let reloaded = MetaStore::load(&path).unwrap();
        let entry = reloaded.get(3).await.unwrap();
        assert_eq!(entry.name.as_deref(), Some("Persisted"));
        assert!(entry.hidden);
    }

    #[test]
    fn test_corrupt_store_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(MetaStore::load(&path).is_err());
    }
}
