use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use toll_api_core::{Capability, CapabilityInfo};

use crate::adapter::Adapter;

#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub slug: String,
    pub priority: i64,
    pub active: bool,
}

/// Process-wide mapping from capability verbs to priority-ordered provider
/// adapters. Reads only take the read lock; runtime registration from
/// approved submissions takes the writer side and re-sorts.
pub struct ProviderRegistry {
    routes: RwLock<HashMap<Capability, Vec<ProviderEntry>>>,
    adapters: RwLock<HashMap<String, Arc<dyn Adapter>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_adapter(&self, slug: &str, adapter: Arc<dyn Adapter>) {
        self.adapters
            .write()
            .expect("Registry lock poisoned")
            .insert(slug.to_string(), adapter);
    }

    pub fn register_provider(&self, capability: Capability, entry: ProviderEntry) {
        let mut routes = self.routes.write().expect("Registry lock poisoned");

        let entries = routes.entry(capability).or_default();

        entries.push(entry);

        // Stable sort keeps insertion order among equal priorities
        entries.sort_by_key(|e| std::cmp::Reverse(e.priority));
    }

    /// Highest-priority active provider with a registered adapter
    pub fn resolve(&self, capability: Capability) -> Option<(String, Arc<dyn Adapter>)> {
        let routes = self.routes.read().expect("Registry lock poisoned");

        let adapters = self.adapters.read().expect("Registry lock poisoned");

        routes
            .get(&capability)?
            .iter()
            .filter(|entry| entry.active)
            .find_map(|entry| {
                adapters
                    .get(&entry.slug)
                    .map(|adapter| (entry.slug.clone(), adapter.clone()))
            })
    }

    pub fn adapter(&self, slug: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .expect("Registry lock poisoned")
            .get(slug)
            .cloned()
    }

    pub fn capability_info(&self, capability: Capability) -> CapabilityInfo {
        let routes = self.routes.read().expect("Registry lock poisoned");

        let providers = routes
            .get(&capability)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.active)
                    .map(|entry| entry.slug.clone())
                    .collect()
            })
            .unwrap_or_default();

        CapabilityInfo {
            capability,
            providers,
        }
    }

    pub fn capabilities(&self) -> Vec<CapabilityInfo> {
        Capability::ALL
            .into_iter()
            .map(|capability| self.capability_info(capability))
            .collect()
    }
}
