//! Durable, priority-ordered main queue.
//!
//! Requests are kept sorted by `(priority desc, created_at asc)` at all
//! times. Every mutation is applied in memory first and then followed by a
//! synchronous write of the whole snapshot; a failed write is reported to the
//! caller but never rolls the mutation back.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_core::{Clock, KeyValueStore, QueueError, QueueResult, Request, RequestId};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::snapshot::{Lifecycle, Snapshot};
use crate::stats::QueueStatistics;

fn sort_key(request: &Request) -> (Reverse<i32>, DateTime<Utc>) {
    (Reverse(request.priority), request.created_at)
}

/// In-memory ordered collection of requests with snapshot persistence.
pub struct DurableOrderedQueue {
    config: QueueConfig,
    requests: Vec<Request>,
    snapshot: Snapshot,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for DurableOrderedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableOrderedQueue")
            .field("config", &self.config)
            .field("len", &self.requests.len())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl DurableOrderedQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let snapshot = Snapshot::new(store, config.storage_key.clone(), config.persist);
        Self {
            config,
            requests: Vec::new(),
            snapshot,
            clock,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Number of queued requests (zero before initialization).
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Load the persisted snapshot, restore ordering and drop expired entries.
    ///
    /// A second call on a ready queue is a no-op. Calling it after `dispose`
    /// reloads from the store.
    pub fn initialize(&mut self) -> QueueResult<()> {
        if self.lifecycle.is_ready() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut requests = self.snapshot.load();
        requests.retain(|r| {
            let first = seen.insert(r.id.clone());
            if !first {
                warn!("dropping duplicate request {} from snapshot", r.id);
            }
            first
        });
        requests.sort_by_key(sort_key);

        self.requests = requests;
        self.lifecycle = Lifecycle::Ready;
        info!(
            "queue initialized with {} requests (key {})",
            self.requests.len(),
            self.config.storage_key
        );

        let now = self.clock.now();
        self.cleanup_expired(now, self.config.max_age)?;
        Ok(())
    }

    /// Insert a request at its ordered position.
    pub fn enqueue(&mut self, request: Request) -> QueueResult<()> {
        self.lifecycle.ensure_ready()?;

        if self.requests.len() >= self.config.max_size {
            warn!(
                "rejecting request {}: queue full ({} requests)",
                request.id, self.config.max_size
            );
            return Err(QueueError::capacity_exceeded(self.config.max_size));
        }
        if self.position(&request.id).is_some() {
            return Err(QueueError::DuplicateId(request.id));
        }

        let key = sort_key(&request);
        let index = self.requests.partition_point(|existing| sort_key(existing) <= key);
        debug!(
            "enqueue request {} (priority {}) at position {index}",
            request.id, request.priority
        );
        self.requests.insert(index, request);
        self.persist()
    }

    /// Remove the request with `id`. Returns whether it was present.
    pub fn remove(&mut self, id: &RequestId) -> QueueResult<bool> {
        self.lifecycle.ensure_ready()?;

        let Some(index) = self.position(id) else {
            return Ok(false);
        };
        self.requests.remove(index);
        debug!("removed request {id}");
        self.persist()?;
        Ok(true)
    }

    /// Replace the request with the same id and restore ordering.
    pub fn update(&mut self, request: Request) -> QueueResult<bool> {
        self.lifecycle.ensure_ready()?;

        let Some(index) = self.position(&request.id) else {
            return Ok(false);
        };
        debug!(
            "update request {} (retry {}/{})",
            request.id, request.retry_count, request.max_retries
        );
        self.requests[index] = request;
        self.requests.sort_by_key(sort_key);
        self.persist()?;
        Ok(true)
    }

    pub fn get(&self, id: &RequestId) -> QueueResult<Option<&Request>> {
        self.lifecycle.ensure_ready()?;
        Ok(self.position(id).map(|index| &self.requests[index]))
    }

    /// All requests in queue order.
    pub fn get_all(&self) -> QueueResult<&[Request]> {
        self.lifecycle.ensure_ready()?;
        Ok(&self.requests)
    }

    /// Highest priority request (oldest on tie), without removing it.
    pub fn get_next(&self) -> QueueResult<Option<&Request>> {
        self.lifecycle.ensure_ready()?;
        Ok(self.requests.first())
    }

    /// Remove and return the head of the queue.
    ///
    /// On `PersistenceFailure` the head has still been removed.
    pub fn dequeue(&mut self) -> QueueResult<Option<Request>> {
        self.lifecycle.ensure_ready()?;

        if self.requests.is_empty() {
            return Ok(None);
        }
        let head = self.requests.remove(0);
        debug!("dequeued request {}", head.id);
        self.persist()?;
        Ok(Some(head))
    }

    /// Requests with retries left whose backoff has elapsed at `now`, in queue order.
    pub fn get_ready_for_retry(&self, now: DateTime<Utc>) -> QueueResult<Vec<Request>> {
        self.lifecycle.ensure_ready()?;
        Ok(self
            .requests
            .iter()
            .filter(|r| r.is_ready(now))
            .cloned()
            .collect())
    }

    pub fn clear(&mut self) -> QueueResult<()> {
        self.lifecycle.ensure_ready()?;
        let cleared = self.requests.len();
        self.requests.clear();
        info!("cleared {cleared} requests from queue");
        self.persist()
    }

    /// Remove every request whose age at `now` is strictly greater than `max_age`.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>, max_age: Duration) -> QueueResult<usize> {
        self.lifecycle.ensure_ready()?;

        let before = self.requests.len();
        self.requests.retain(|r| r.age(now) <= max_age);
        let removed = before - self.requests.len();

        if removed > 0 {
            info!("expired {removed} requests older than {max_age:?}");
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> QueueResult<QueueStatistics> {
        self.lifecycle.ensure_ready()?;
        Ok(QueueStatistics::collect(
            &self.requests,
            self.config.max_size,
            self.clock.now(),
        ))
    }

    /// Persist the final state, drop the in-memory state and stop accepting operations.
    pub fn dispose(&mut self) -> QueueResult<()> {
        let result = if self.lifecycle.is_ready() {
            self.persist()
        } else {
            Ok(())
        };
        self.requests.clear();
        self.lifecycle = Lifecycle::Disposed;
        debug!("queue disposed");
        result
    }

    fn position(&self, id: &RequestId) -> Option<usize> {
        self.requests.iter().position(|r| &r.id == id)
    }

    fn persist(&self) -> QueueResult<()> {
        self.snapshot.save(&self.requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use deferq_core::{FixedClock, InMemoryStore};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn request(id: &str, priority: i32, created_secs: i64) -> Request {
        Request::new("POST", "https://api.example.com/sync")
            .with_id(id)
            .with_priority(priority)
            .with_created_at(at(created_secs))
    }

    fn queue_with(store: Arc<InMemoryStore>, config: QueueConfig) -> DurableOrderedQueue {
        let clock = Arc::new(FixedClock::new(at(0)));
        let mut queue = DurableOrderedQueue::new(config, store, clock);
        queue.initialize().unwrap();
        queue
    }

    fn queue() -> DurableOrderedQueue {
        queue_with(Arc::new(InMemoryStore::new()), QueueConfig::default())
    }

    fn ids(queue: &DurableOrderedQueue) -> Vec<String> {
        queue
            .get_all()
            .unwrap()
            .iter()
            .map(|r| r.id.to_string())
            .collect()
    }

    #[test]
    fn operations_fail_before_initialize() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let mut queue = DurableOrderedQueue::new(QueueConfig::default(), store, clock);

        assert!(matches!(
            queue.enqueue(request("a", 0, 0)),
            Err(QueueError::NotInitialized)
        ));
        assert!(matches!(queue.get_all(), Err(QueueError::NotInitialized)));
        assert!(matches!(queue.dequeue(), Err(QueueError::NotInitialized)));
        assert!(matches!(queue.statistics(), Err(QueueError::NotInitialized)));
    }

    #[test]
    fn higher_priority_sorts_first() {
        let mut queue = queue();
        queue.enqueue(request("A", 1, 0)).unwrap();
        queue.enqueue(request("B", 5, 1)).unwrap();
        assert_eq!(ids(&queue), vec!["B", "A"]);
    }

    #[test]
    fn ties_keep_creation_order() {
        let mut queue = queue();
        queue.enqueue(request("late", 1, 10)).unwrap();
        queue.enqueue(request("early", 1, 5)).unwrap();
        queue.enqueue(request("same-time", 1, 10)).unwrap();
        assert_eq!(ids(&queue), vec!["early", "late", "same-time"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut queue = queue();
        queue.enqueue(request("a", 0, 0)).unwrap();
        let err = queue.enqueue(request("a", 9, 1)).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(id) if id.as_str() == "a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut queue = queue_with(
            Arc::new(InMemoryStore::new()),
            QueueConfig::default().with_max_size(2),
        );
        queue.enqueue(request("a", 0, 0)).unwrap();
        queue.enqueue(request("b", 0, 1)).unwrap();
        let err = queue.enqueue(request("c", 0, 2)).unwrap_err();
        assert!(matches!(err, QueueError::CapacityExceeded { max_size: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn empty_queue_returns_none() {
        let mut queue = queue();
        assert!(queue.get_next().unwrap().is_none());
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn dequeue_takes_head() {
        let mut queue = queue();
        queue.enqueue(request("low", 0, 0)).unwrap();
        queue.enqueue(request("high", 3, 5)).unwrap();

        assert_eq!(queue.get_next().unwrap().unwrap().id.as_str(), "high");
        let head = queue.dequeue().unwrap().unwrap();
        assert_eq!(head.id.as_str(), "high");
        assert_eq!(ids(&queue), vec!["low"]);
    }

    #[test]
    fn remove_and_get() {
        let mut queue = queue();
        queue.enqueue(request("a", 0, 0)).unwrap();

        assert!(queue.get(&"a".into()).unwrap().is_some());
        assert!(queue.remove(&"a".into()).unwrap());
        assert!(!queue.remove(&"a".into()).unwrap());
        assert!(queue.get(&"a".into()).unwrap().is_none());
    }

    #[test]
    fn update_resorts() {
        let mut queue = queue();
        queue.enqueue(request("a", 5, 0)).unwrap();
        queue.enqueue(request("b", 1, 1)).unwrap();

        let mut b = queue.get(&"b".into()).unwrap().unwrap().clone();
        b.priority = 10;
        assert!(queue.update(b).unwrap());
        assert_eq!(ids(&queue), vec!["b", "a"]);

        assert!(!queue.update(request("missing", 0, 0)).unwrap());
    }

    #[test]
    fn ready_for_retry_respects_backoff_and_budget() {
        let mut queue = queue();

        let mut waiting = request("waiting", 0, 0);
        waiting.retry_count = 1;
        waiting.last_retry_time = Some(at(100));
        waiting.retry_delay = Some(Duration::from_secs(30));

        let mut exhausted = request("exhausted", 0, 1);
        exhausted.retry_count = exhausted.max_retries;

        queue.enqueue(request("fresh", 0, 2)).unwrap();
        queue.enqueue(waiting).unwrap();
        queue.enqueue(exhausted).unwrap();

        let ready: Vec<_> = queue
            .get_ready_for_retry(at(110))
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ready, vec!["fresh"]);

        let ready = queue.get_ready_for_retry(at(130)).unwrap();
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn cleanup_removes_strictly_older() {
        let mut queue = queue();
        queue.enqueue(request("old", 0, 0)).unwrap();
        queue.enqueue(request("edge", 0, 40)).unwrap();
        queue.enqueue(request("new", 0, 90)).unwrap();

        let removed = queue
            .cleanup_expired(at(100), Duration::from_secs(60))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ids(&queue), vec!["edge", "new"]);
    }

    #[test]
    fn snapshot_roundtrip_preserves_order() {
        let store = Arc::new(InMemoryStore::new());
        {
            let mut queue = queue_with(store.clone(), QueueConfig::default());
            queue.enqueue(request("a", 1, 0)).unwrap();
            queue.enqueue(request("b", 5, 1)).unwrap();
            queue.enqueue(request("c", 1, -5)).unwrap();
        }

        let reloaded = queue_with(store, QueueConfig::default());
        assert_eq!(ids(&reloaded), vec!["b", "c", "a"]);
    }

    #[test]
    fn corrupt_snapshot_initializes_empty() {
        let store = Arc::new(InMemoryStore::new());
        store.set("deferq.queue", "definitely not json").unwrap();

        let queue = queue_with(store.clone(), QueueConfig::default());
        assert!(queue.is_empty());
        assert_eq!(store.get("deferq.queue").unwrap(), None);
    }

    #[test]
    fn unsorted_snapshot_is_reordered_and_deduplicated() {
        let store = Arc::new(InMemoryStore::new());
        let raw = serde_json::to_string(&vec![
            request("a", 0, 0),
            request("b", 9, 1),
            request("a", 3, 2),
        ])
        .unwrap();
        store.set("deferq.queue", &raw).unwrap();

        let queue = queue_with(store, QueueConfig::default());
        assert_eq!(ids(&queue), vec!["b", "a"]);
    }

    #[test]
    fn initialize_expires_stale_snapshot_entries() {
        let store = Arc::new(InMemoryStore::new());
        let raw = serde_json::to_string(&vec![request("stale", 0, -100_000), request("ok", 0, -10)])
            .unwrap();
        store.set("deferq.queue", &raw).unwrap();

        let queue = queue_with(store, QueueConfig::default());
        assert_eq!(ids(&queue), vec!["ok"]);
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut queue = queue();
        queue.enqueue(request("a", 0, 0)).unwrap();
        queue.initialize().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn persistence_failure_keeps_mutation() {
        let store = Arc::new(InMemoryStore::new());
        let mut queue = queue_with(store.clone(), QueueConfig::default());

        store.set_fail_writes(true);
        let err = queue.enqueue(request("a", 0, 0)).unwrap_err();
        assert!(err.is_persistence_failure());
        assert_eq!(queue.len(), 1);

        store.set_fail_writes(false);
        queue.enqueue(request("b", 0, 1)).unwrap();
        let persisted: Vec<Request> =
            serde_json::from_str(&store.get("deferq.queue").unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[test]
    fn without_persistence_nothing_is_written() {
        let store = Arc::new(InMemoryStore::new());
        let mut queue = queue_with(store.clone(), QueueConfig::default().with_persistence(false));
        queue.enqueue(request("a", 0, 0)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn dispose_persists_and_blocks_operations() {
        let store = Arc::new(InMemoryStore::new());
        let mut queue = queue_with(store.clone(), QueueConfig::default());
        queue.enqueue(request("a", 0, 0)).unwrap();

        queue.dispose().unwrap();
        assert_eq!(queue.lifecycle(), Lifecycle::Disposed);
        assert!(matches!(queue.get_all(), Err(QueueError::NotInitialized)));

        queue.initialize().unwrap();
        assert_eq!(ids(&queue), vec!["a"]);
    }

    #[test]
    fn clear_empties_and_persists() {
        let store = Arc::new(InMemoryStore::new());
        let mut queue = queue_with(store.clone(), QueueConfig::default());
        queue.enqueue(request("a", 0, 0)).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(store.get("deferq.queue").unwrap().as_deref(), Some("[]"));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: for any enqueue sequence, `get_all` is sorted by
        /// (priority desc, created_at asc).
        #[test]
        fn always_sorted(entries in prop::collection::vec((-5i32..5, 0i64..1_000), 0..40)) {
            let mut queue = queue();
            for (i, (priority, created)) in entries.iter().enumerate() {
                queue.enqueue(request(&format!("r{i}"), *priority, *created)).unwrap();
            }
            let all = queue.get_all().unwrap();
            prop_assert_eq!(all.len(), entries.len());
            for pair in all.windows(2) {
                prop_assert!(sort_key(&pair[0]) <= sort_key(&pair[1]));
            }
        }

        /// Property: cleanup removes exactly the entries strictly older than max_age.
        #[test]
        fn cleanup_is_exact(ages in prop::collection::vec(0i64..200, 0..40), max_age in 0u64..200) {
            let mut queue = queue();
            for (i, age) in ages.iter().enumerate() {
                queue.enqueue(request(&format!("r{i}"), 0, 1_000 - age)).unwrap();
            }
            let before: Vec<Request> = queue.get_all().unwrap().to_vec();

            let removed = queue
                .cleanup_expired(at(1_000), Duration::from_secs(max_age))
                .unwrap();

            let expected: Vec<Request> = before
                .into_iter()
                .filter(|r| r.age(at(1_000)) <= Duration::from_secs(max_age))
                .collect();
            prop_assert_eq!(removed, ages.len() - expected.len());
            prop_assert_eq!(queue.get_all().unwrap(), expected.as_slice());
        }
    }
}
