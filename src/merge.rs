//! Merge engine: overlays the override store onto an upstream snapshot to
//! produce the externally visible link views.
//!
//! The merge is pure and deterministic.  Overrides win field by field over
//! upstream-derived defaults, orphaned overrides (ids no longer present
//! upstream) produce nothing, and the result is sorted by primary domain so
//! repeated listings of the same inputs are byte-identical.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::MetaOverride;
use crate::upstream::HostRecord;

/// Glyph shown for links with no emoji override.
pub const DEFAULT_EMOJI: &str = "\u{1F517}";

/// One merged, externally visible link.  Derived on every listing, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkView {
    pub id: u64,
    pub domain_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_port: Option<u16>,
    pub name: String,
    pub description: String,
    pub emoji: String,
    pub hidden: bool,
}

/// Merge one host with its override, if any.  The resulting view always has
/// a non-empty name and a definite hidden flag.
pub fn merge_link(host: &HostRecord, meta: Option<&MetaOverride>) -> LinkView {
    let name = meta
        .and_then(|m| m.name.clone())
        .or_else(|| {
            host.domain_names
                .iter()
                .find(|d| !d.trim().is_empty())
                .map(|d| d.trim().to_string())
        })
        .unwrap_or_else(|| format!("Link #{}", host.id));

    LinkView {
        id: host.id,
        domain_names: host.domain_names.clone(),
        forward_host: host.forward_host.clone(),
        forward_port: host.forward_port,
        name,
        description: meta.and_then(|m| m.description.clone()).unwrap_or_default(),
        emoji: meta
            .and_then(|m| m.emoji.clone())
            .unwrap_or_else(|| DEFAULT_EMOJI.to_string()),
        hidden: meta.map(|m| m.hidden).unwrap_or(false),
    }
}

/// Merge a full snapshot, hiding hidden links unless `include_hidden`, and
/// sort by lowercased primary domain (id as tie-break for hosts without one).
pub fn merge_links(
    hosts: &[HostRecord],
    overrides: &HashMap<u64, MetaOverride>,
    include_hidden: bool,
) -> Vec<LinkView> {
    let mut links: Vec<LinkView> = hosts
        .iter()
        .map(|host| merge_link(host, overrides.get(&host.id)))
        .filter(|link| include_hidden || !link.hidden)
        .collect();

    links.sort_by(|a, b| {
        let a_key = a.domain_names.first().map(|d| d.to_lowercase());
        let b_key = b.domain_names.first().map(|d| d.to_lowercase());
        a_key.cmp(&b_key).then(a.id.cmp(&b.id))
    });
    links
}
