//! Capability Registry & Naming.
//!
//! Capability records are stored in a flat, `Arc`-free map keyed by FQDN
//! string rather than an owning-pointer graph, so resolution and listing
//! never need to walk a reference graph.
//! Reads are lock-free snapshots via [`dashmap::DashMap`]; writes that must
//! be atomic across more than one entry (rename, merge) take an internal
//! write lock so no reader observes a half-completed mutation.

mod merge;
mod naming;

pub use merge::MergeError;
pub use naming::generate_fqdn;

use std::sync::Mutex;

use cellrun_protocol::capability::Alias;
use cellrun_protocol::Capability;
use cellrun_protocol::Fqdn;
use dashmap::DashMap;
use tracing::debug;

/// `(org, project, alias)`, the alias table's key.
type AliasKey = (String, String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NotFound(String),
    AlreadyExists(String),
    Merge(MergeError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(name) => write!(f, "no such capability: {name}"),
            RegistryError::AlreadyExists(fqdn) => write!(f, "capability already exists: {fqdn}"),
            RegistryError::Merge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Shared, process-wide store of learned capabilities. Outlives any single
/// execution.
pub struct CapabilityRegistry {
    capabilities: DashMap<String, Capability>,
    aliases: DashMap<AliasKey, Fqdn>,
    /// Serializes create/rename/merge so multi-entry mutations stay
    /// transactional. Reads never take this lock.
    write_lock: Mutex<()>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: DashMap::new(),
            aliases: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// `resolve(name, scope) -> Capability | None`. `scope` is
    /// `(org, project)`; `name` is either a display name (`namespace:action`)
    /// or a full FQDN string. Resolution order: (1) exact current display
    /// name/FQDN, (2) the alias table, (3) `None`.
    pub fn resolve(&self, name: &str, org: &str, project: &str) -> Option<Capability> {
        if let Some(fqdn) = Fqdn::parse(name) {
            if let Some(cap) = self.capabilities.get(&fqdn.to_string()) {
                return Some(cap.clone());
            }
        }

        if let Some(found) = self
            .capabilities
            .iter()
            .find(|entry| {
                entry.value().fqdn.org == org
                    && entry.value().fqdn.project == project
                    && entry.value().display_name == name
            })
            .map(|entry| entry.value().clone())
        {
            return Some(found);
        }

        let key = (org.to_string(), project.to_string(), name.to_string());
        if let Some(target) = self.aliases.get(&key) {
            debug!(alias = name, target = %target.value(), "resolved capability via deprecated alias");
            return self.capabilities.get(&target.value().to_string()).map(|e| e.clone());
        }

        None
    }

    /// Registers a freshly learned capability. Fails if the FQDN already
    /// exists.
    pub fn insert(&self, capability: Capability) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let key = capability.fqdn.to_string();
        if self.capabilities.contains_key(&key) {
            return Err(RegistryError::AlreadyExists(key));
        }
        self.capabilities.insert(key, capability);
        Ok(())
    }

    /// `rename(fqdn, new_display_name)`: renames a capability's
    /// display name, inserting the prior name into the alias table. Does
    /// not change the FQDN, so any existing aliases pointing at it remain
    /// valid. Returns `true` if a `tools/list_changed` notification should
    /// be emitted (always, on success) — emission itself is the caller's
    /// responsibility since the notification bus is an external
    /// collaborator the registry does not own.
    pub fn rename(&self, fqdn: &Fqdn, new_display_name: impl Into<String>) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let key = fqdn.to_string();
        let mut entry = self
            .capabilities
            .get_mut(&key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        let old_display_name = entry.display_name.clone();
        let new_display_name = new_display_name.into();
        entry.display_name = new_display_name;
        entry.updated_at = chrono::Utc::now();
        drop(entry);

        self.aliases.insert(
            (fqdn.org.clone(), fqdn.project.clone(), old_display_name),
            fqdn.clone(),
        );
        Ok(())
    }

    /// `merge(target, source, force_source_snippet)`.
    /// Precondition: both capabilities have identical `tools_used` lists.
    /// The source row is deleted on success.
    pub fn merge(
        &self,
        target_fqdn: &Fqdn,
        source_fqdn: &Fqdn,
        force_source_snippet: bool,
    ) -> Result<Capability, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let target = self
            .capabilities
            .get(&target_fqdn.to_string())
            .map(|e| e.clone())
            .ok_or_else(|| RegistryError::NotFound(target_fqdn.to_string()))?;
        let source = self
            .capabilities
            .get(&source_fqdn.to_string())
            .map(|e| e.clone())
            .ok_or_else(|| RegistryError::NotFound(source_fqdn.to_string()))?;

        let merged = merge::merge_capabilities(target, source, force_source_snippet)
            .map_err(RegistryError::Merge)?;

        self.capabilities
            .insert(target_fqdn.to_string(), merged.clone());
        self.capabilities.remove(&source_fqdn.to_string());
        Ok(merged)
    }

    pub fn list(&self, org: &str, project: &str) -> Vec<Capability> {
        self.capabilities
            .iter()
            .filter(|e| e.value().fqdn.org == org && e.value().fqdn.project == project)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Substring search over display names within a scope.
    pub fn search(&self, org: &str, project: &str, query: &str) -> Vec<Capability> {
        let query = query.to_lowercase();
        self.list(org, project)
            .into_iter()
            .filter(|c| c.display_name.to_lowercase().contains(&query))
            .collect()
    }

    /// `whois(fqdn)`: full record lookup by exact FQDN, bypassing alias
    /// resolution and display-name matching.
    pub fn whois(&self, fqdn: &Fqdn) -> Option<Capability> {
        self.capabilities.get(&fqdn.to_string()).map(|e| e.clone())
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(action: &str) -> Capability {
        let fqdn = generate_fqdn("acme", "widgets", "fs", action, "print('hi')", |_| false);
        Capability::new(fqdn, "print('hi')".to_string(), vec!["fs:read".to_string()])
    }

    #[test]
    fn resolve_finds_exact_display_name_in_scope() {
        let registry = CapabilityRegistry::new();
        let cap = sample("read_json");
        registry.insert(cap.clone()).expect("insert succeeds");
        let found = registry
            .resolve("fs:read_json", "acme", "widgets")
            .expect("resolves");
        assert_eq!(found.fqdn, cap.fqdn);
    }

    #[test]
    fn rename_then_resolve_by_old_name_logs_deprecation_and_still_resolves() {
        let registry = CapabilityRegistry::new();
        let cap = sample("read_json");
        registry.insert(cap.clone()).expect("insert succeeds");
        registry
            .rename(&cap.fqdn, "fs:read_json_v2")
            .expect("rename succeeds");

        assert!(registry.resolve("fs:read_json", "acme", "widgets").is_some());
        assert!(registry
            .resolve("fs:read_json_v2", "acme", "widgets")
            .is_some());
        assert_eq!(registry.alias_count(), 1);
    }

    #[test]
    fn merge_requires_identical_tools_used() {
        let registry = CapabilityRegistry::new();
        let mut a = sample("read_json");
        a.tools_used = vec!["fs:read".to_string()];
        let mut b = sample("read_json_2");
        b.tools_used = vec!["fs:read".to_string(), "net:get".to_string()];
        registry.insert(a.clone()).expect("insert a");
        registry.insert(b.clone()).expect("insert b");

        let err = registry.merge(&a.fqdn, &b.fqdn, false).unwrap_err();
        assert!(matches!(err, RegistryError::Merge(MergeError::ToolsUsedMismatch)));
    }

    #[test]
    fn merge_sums_stats_and_deletes_source() {
        let registry = CapabilityRegistry::new();
        let mut a = sample("read_json");
        a.usage_count = 3;
        a.success_count = 2;
        a.total_latency_ms = 100;
        let mut b = sample("read_json_2");
        b.usage_count = 1;
        b.success_count = 1;
        b.total_latency_ms = 50;

        registry.insert(a.clone()).expect("insert a");
        registry.insert(b.clone()).expect("insert b");

        let merged = registry.merge(&a.fqdn, &b.fqdn, false).expect("merge succeeds");
        assert_eq!(merged.usage_count, 4);
        assert_eq!(merged.success_count, 3);
        assert_eq!(merged.total_latency_ms, 150);
        assert!(registry.whois(&b.fqdn).is_none());
    }

    #[test]
    fn list_and_search_are_scoped_to_org_and_project() {
        let registry = CapabilityRegistry::new();
        registry.insert(sample("read_json")).expect("insert");
        registry.insert(sample("write_json")).expect("insert");
        assert_eq!(registry.list("acme", "widgets").len(), 2);
        assert_eq!(registry.search("acme", "widgets", "read").len(), 1);
        assert_eq!(registry.list("other", "widgets").len(), 0);
        let _ = json!({});
    }
}
