//! Terminal holding area for requests that can no longer be retried.
//!
//! Shares the lifecycle and persistence contract of the main queue but keeps
//! entries ordered by creation time only. When full, the oldest entry is
//! evicted to make room.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_core::{Clock, KeyValueStore, QueueResult, Request, RequestId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DeadLetterConfig;
use crate::snapshot::{Lifecycle, Snapshot};
use crate::stats::DeadLetterStatistics;

/// Full dump of the store for external analysis.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterExport {
    pub exported_at: DateTime<Utc>,
    pub statistics: DeadLetterStatistics,
    pub requests: Vec<Request>,
}

pub struct DeadLetterStore {
    config: DeadLetterConfig,
    requests: Vec<Request>,
    snapshot: Snapshot,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("config", &self.config)
            .field("len", &self.requests.len())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    pub fn new(
        config: DeadLetterConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshot = Snapshot::new(store, config.storage_key.clone(), config.persist);
        Self {
            config,
            requests: Vec::new(),
            snapshot,
            clock,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Load the persisted snapshot and drop entries older than the configured max age.
    pub fn initialize(&mut self) -> QueueResult<()> {
        if self.lifecycle.is_ready() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut requests = self.snapshot.load();
        // Later entries win, matching replace-on-enqueue.
        requests.reverse();
        requests.retain(|r| seen.insert(r.id.clone()));
        requests.sort_by_key(|r| r.created_at);

        self.requests = requests;
        self.lifecycle = Lifecycle::Ready;
        info!(
            "dead-letter store initialized with {} requests (key {})",
            self.requests.len(),
            self.config.storage_key
        );

        let now = self.clock.now();
        self.cleanup_old(now, self.config.max_age)?;
        Ok(())
    }

    /// Store a failed request.
    ///
    /// An entry with the same id is replaced. When the store is full the
    /// oldest entry is evicted first. Returns `false` when the store has no
    /// capacity at all and the request was discarded.
    pub fn enqueue(&mut self, request: Request) -> QueueResult<bool> {
        self.lifecycle.ensure_ready()?;

        if let Some(index) = self.position(&request.id) {
            debug!("replacing dead-lettered request {}", request.id);
            self.requests.remove(index);
        }

        while !self.requests.is_empty() && self.requests.len() >= self.config.max_size {
            let evicted = self.requests.remove(0);
            warn!(
                "dead-letter store full ({} requests); evicted oldest request {}",
                self.config.max_size, evicted.id
            );
        }

        let stored = self.config.max_size > 0;
        if !stored {
            warn!("dead-letter store has no capacity; discarding request {}", request.id);
        } else {
            let index = self
                .requests
                .partition_point(|existing| existing.created_at <= request.created_at);
            warn!(
                "dead-lettered request {} {} {}: {}",
                request.id,
                request.method,
                request.url,
                request.failure_reason.as_deref().unwrap_or("unknown")
            );
            self.requests.insert(index, request);
        }

        self.persist()?;
        Ok(stored)
    }

    pub fn remove(&mut self, id: &RequestId) -> QueueResult<bool> {
        self.lifecycle.ensure_ready()?;

        let Some(index) = self.position(id) else {
            return Ok(false);
        };
        self.requests.remove(index);
        debug!("removed dead-lettered request {id}");
        self.persist()?;
        Ok(true)
    }

    pub fn get(&self, id: &RequestId) -> QueueResult<Option<&Request>> {
        self.lifecycle.ensure_ready()?;
        Ok(self.position(id).map(|index| &self.requests[index]))
    }

    /// All entries, oldest first.
    pub fn get_all(&self) -> QueueResult<&[Request]> {
        self.lifecycle.ensure_ready()?;
        Ok(&self.requests)
    }

    pub fn get_by_failure_reason(&self, reason: &str) -> QueueResult<Vec<&Request>> {
        self.filter(|r| r.failure_reason.as_deref() == Some(reason))
    }

    pub fn get_by_status_code(&self, code: u16) -> QueueResult<Vec<&Request>> {
        self.filter(|r| r.last_status_code == Some(code))
    }

    /// Entries whose age is strictly greater than `age`.
    pub fn get_older_than(&self, age: Duration) -> QueueResult<Vec<&Request>> {
        let now = self.clock.now();
        self.filter(|r| r.age(now) > age)
    }

    /// Release the entry with `id` from the store.
    ///
    /// Returns the released request, if present. Resubmitting it to the main
    /// queue is up to the caller.
    pub fn retry(&mut self, id: &RequestId) -> QueueResult<Option<Request>> {
        self.lifecycle.ensure_ready()?;

        let Some(index) = self.position(id) else {
            return Ok(None);
        };
        let request = self.requests.remove(index);
        info!("released request {id} from dead-letter store");
        self.persist()?;
        Ok(Some(request))
    }

    /// Remove every entry whose age at `now` is strictly greater than `max_age`.
    pub fn cleanup_old(&mut self, now: DateTime<Utc>, max_age: Duration) -> QueueResult<usize> {
        self.lifecycle.ensure_ready()?;

        let before = self.requests.len();
        self.requests.retain(|r| r.age(now) <= max_age);
        let removed = before - self.requests.len();

        if removed > 0 {
            info!("purged {removed} dead-lettered requests older than {max_age:?}");
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> QueueResult<DeadLetterStatistics> {
        self.lifecycle.ensure_ready()?;
        Ok(DeadLetterStatistics::collect(
            &self.requests,
            self.config.max_size,
            self.clock.now(),
        ))
    }

    pub fn export(&self) -> QueueResult<DeadLetterExport> {
        let statistics = self.statistics()?;
        Ok(DeadLetterExport {
            exported_at: self.clock.now(),
            statistics,
            requests: self.requests.clone(),
        })
    }

    pub fn dispose(&mut self) -> QueueResult<()> {
        let result = if self.lifecycle.is_ready() {
            self.persist()
        } else {
            Ok(())
        };
        self.requests.clear();
        self.lifecycle = Lifecycle::Disposed;
        debug!("dead-letter store disposed");
        result
    }

    fn filter<F>(&self, predicate: F) -> QueueResult<Vec<&Request>>
    where
        F: Fn(&Request) -> bool,
    {
        self.lifecycle.ensure_ready()?;
        Ok(self.requests.iter().filter(|r| predicate(r)).collect())
    }

    fn position(&self, id: &RequestId) -> Option<usize> {
        self.requests.iter().position(|r| &r.id == id)
    }

    fn persist(&self) -> QueueResult<()> {
        self.snapshot.save(&self.requests)
    }
}
