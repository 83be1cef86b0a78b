//! Endpoint registry: the set of endpoints health checking should cover.
//!
//! Watchers add and remove endpoints by [`EndpointKey`]. Several watchers
//! may share one registry, so implementations serialize mutation
//! internally.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use cellwatch_core::{EndpointKey, NodeRecord};

/// Registry capability consumed by topology watchers.
///
/// Both calls are idempotent: adding a registered key again or removing
/// an absent key is not an error.
pub trait HealthCheck: Send + Sync {
    /// Start tracking the endpoint described by `record` under `key`.
    fn add_endpoint(&self, key: &EndpointKey, record: &NodeRecord);

    /// Stop tracking the endpoint registered under `key`.
    fn remove_endpoint(&self, key: &EndpointKey);
}

/// A registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEntry {
    pub record: NodeRecord,
    /// Unix timestamp (seconds) of the first add for this key.
    pub registered_at: u64,
}

/// In-memory registry keyed by endpoint key.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<EndpointKey, EndpointEntry>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.read().expect("endpoints lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.endpoints
            .read()
            .expect("endpoints lock")
            .contains_key(key)
    }

    pub fn get(&self, key: &EndpointKey) -> Option<EndpointEntry> {
        self.endpoints
            .read()
            .expect("endpoints lock")
            .get(key)
            .cloned()
    }

    /// All registered endpoints, ordered by key.
    pub fn endpoints(&self) -> Vec<(EndpointKey, EndpointEntry)> {
        let endpoints = self.endpoints.read().expect("endpoints lock");
        let mut all: Vec<_> = endpoints
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl HealthCheck for EndpointRegistry {
    fn add_endpoint(&self, key: &EndpointKey, record: &NodeRecord) {
        let mut endpoints = self.endpoints.write().expect("endpoints lock");
        if endpoints.contains_key(key) {
            return;
        }
        endpoints.insert(
            key.clone(),
            EndpointEntry {
                record: record.clone(),
                registered_at: epoch_secs(),
            },
        );
        debug!(%key, total = endpoints.len(), "endpoint registered");
    }

    fn remove_endpoint(&self, key: &EndpointKey) {
        let mut endpoints = self.endpoints.write().expect("endpoints lock");
        if endpoints.remove(key).is_some() {
            debug!(%key, total = endpoints.len(), "endpoint deregistered");
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
