//! Named, filtered views over the tool catalog.
//!
//! A toolset narrows `search_tools`/`list_tools` to a subset of the catalog
//! without touching the underlying registry — grounded on the same
//! allow/deny shape `BackendConfig` already uses for namespacing, applied
//! here at the catalog-view level instead of at registration time.

use serde::{Deserialize, Serialize};

use crate::registry::ToolEntry;

/// Declarative toolset definition, as read from `toolsets:` in config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsetSpec {
    pub name: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub policy: ToolsetPolicy,
}

/// Default membership when neither `allow` nor a namespace/tag filter
/// matches a given tool.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolsetPolicy {
    /// Nothing is in scope unless explicitly allowed or filter-matched.
    #[default]
    DenyAll,
    /// Everything is in scope unless explicitly denied.
    AllowAll,
}

/// A toolset resolved against a specific catalog snapshot.
pub struct Toolset {
    pub id: String,
    pub spec: ToolsetSpec,
}

/// Slugify a toolset name into its stable id: `toolset:<slug>`.
///
/// Lowercases, replaces runs of non-alphanumeric characters with a single
/// `-`, and trims leading/trailing `-` — stable across restarts for the same
/// input name, matching the spec's requirement that a toolset's id not
/// depend on registration order.
pub fn toolset_id(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true; // suppress leading '-'
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('-');
            last_was_sep = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    format!("toolset:{slug}")
}

impl Toolset {
    pub fn from_spec(spec: ToolsetSpec) -> Self {
        let id = toolset_id(&spec.name);
        Self { id, spec }
    }

    /// Whether `entry` is in scope for this toolset.
    pub fn contains(&self, entry: &ToolEntry) -> bool {
        if self.spec.deny.iter().any(|d| d == &entry.name) {
            return false;
        }
        if self.spec.allow.iter().any(|a| a == &entry.name) {
            return true;
        }
        if self
            .spec
            .namespaces
            .iter()
            .any(|ns| ns == &entry.backend_name)
        {
            return true;
        }
        if !self.spec.tags.is_empty() && entry.tags.iter().any(|t| self.spec.tags.contains(t)) {
            return true;
        }
        self.spec.policy == ToolsetPolicy::AllowAll
    }

    /// Filter a full catalog snapshot down to this toolset's members.
    pub fn filter<'a>(&self, entries: &'a [ToolEntry]) -> Vec<&'a ToolEntry> {
        entries.iter().filter(|e| self.contains(e)).collect()
    }
}
