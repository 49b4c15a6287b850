//! Snapshot persistence shared by the main queue and the dead-letter store.

use std::sync::Arc;

use deferq_core::{KeyValueStore, QueueError, QueueResult, Request};
use tracing::{debug, error, warn};

/// `Uninitialized → Ready → Disposed` lifecycle of a persisted collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Ready,
    Disposed,
}

impl Lifecycle {
    pub fn is_ready(self) -> bool {
        self == Lifecycle::Ready
    }

    /// Fail with `NotInitialized` unless ready.
    pub fn ensure_ready(self) -> QueueResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(QueueError::NotInitialized)
        }
    }
}

/// A JSON array of requests stored under one key.
#[derive(Clone)]
pub(crate) struct Snapshot {
    store: Arc<dyn KeyValueStore>,
    key: String,
    enabled: bool,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    pub(crate) fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, enabled: bool) -> Self {
        Self {
            store,
            key: key.into(),
            enabled,
        }
    }

    /// Load the stored requests.
    ///
    /// Never fails: unreadable or unparsable data yields an empty collection,
    /// and a corrupt entry is removed from the store.
    pub(crate) fn load(&self) -> Vec<Request> {
        if !self.enabled {
            return Vec::new();
        }

        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!("failed to read snapshot {}; starting empty: {err}", self.key);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Request>>(&raw) {
            Ok(requests) => {
                debug!("loaded {} requests from snapshot {}", requests.len(), self.key);
                requests
            }
            Err(err) => {
                warn!("discarding corrupt snapshot {}: {err}", self.key);
                if let Err(err) = self.store.remove(&self.key) {
                    warn!("failed to remove corrupt snapshot {}: {err}", self.key);
                }
                Vec::new()
            }
        }
    }

    /// Write the full collection. A no-op when persistence is disabled.
    pub(crate) fn save(&self, requests: &[Request]) -> QueueResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let json = match serde_json::to_string(requests) {
            Ok(json) => json,
            Err(err) => {
                error!("failed to serialise snapshot {}: {err}", self.key);
                return Err(QueueError::PersistenceFailure(
                    deferq_core::StoreError::unavailable(err.to_string()),
                ));
            }
        };

        self.store.set(&self.key, &json).map_err(|err| {
            error!("failed to persist snapshot {}: {err}", self.key);
            QueueError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferq_core::InMemoryStore;

    #[test]
    fn lifecycle_gate() {
        assert!(Lifecycle::Ready.ensure_ready().is_ok());
        assert!(matches!(
            Lifecycle::Uninitialized.ensure_ready(),
            Err(QueueError::NotInitialized)
        ));
        assert!(matches!(
            Lifecycle::Disposed.ensure_ready(),
            Err(QueueError::NotInitialized)
        ));
    }

    #[test]
    fn corrupt_snapshot_is_discarded() {
        let store = Arc::new(InMemoryStore::new());
        store.set("k", "{not json").unwrap();

        let snapshot = Snapshot::new(store.clone(), "k", true);
        assert!(snapshot.load().is_empty());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn disabled_snapshot_never_touches_store() {
        let store = Arc::new(InMemoryStore::new());
        let snapshot = Snapshot::new(store.clone(), "k", false);
        snapshot
            .save(&[Request::new("GET", "/").with_id("a")])
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn save_failure_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_writes(true);
        let snapshot = Snapshot::new(store, "k", true);
        let err = snapshot.save(&[]).unwrap_err();
        assert!(err.is_persistence_failure());
    }
}
