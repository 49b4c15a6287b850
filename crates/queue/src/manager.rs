//! Orchestration of the main queue, the dead-letter store and the retry policy.

use std::sync::Arc;

use deferq_core::{Clock, ExecutionFailure, KeyValueStore, QueueResult, Request, RequestId};
use tracing::{debug, info, warn};

use crate::config::DeferqConfig;
use crate::dead_letter::DeadLetterStore;
use crate::ordered_queue::DurableOrderedQueue;
use crate::policy::RetryPolicy;
use crate::stats::CombinedStatistics;

/// What happened to a request after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Updated in the main queue with new retry bookkeeping.
    Retried(Request),
    /// Moved to the dead-letter store.
    DeadLettered,
    /// Removed with nowhere to go.
    Dropped,
    /// The request had already left the main queue; nothing was changed.
    NotQueued,
}

/// Single owner of the main queue and its optional dead-letter store.
pub struct RetryManager {
    queue: DurableOrderedQueue,
    dead_letter: Option<DeadLetterStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("queue", &self.queue)
            .field("dead_letter", &self.dead_letter)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    /// Build the queue, policy and (when enabled) dead-letter store over one store.
    pub fn new(config: DeferqConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let dead_letter = config
            .retry
            .dead_letter_enabled
            .then(|| DeadLetterStore::new(config.dead_letter.clone(), store.clone(), clock.clone()));

        Self {
            queue: DurableOrderedQueue::new(config.queue, store, clock.clone()),
            dead_letter,
            policy: RetryPolicy::new(config.retry),
            clock,
        }
    }

    pub fn queue(&self) -> &DurableOrderedQueue {
        &self.queue
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterStore> {
        self.dead_letter.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn initialize(&mut self) -> QueueResult<()> {
        self.queue.initialize()?;
        if let Some(dead_letter) = self.dead_letter.as_mut() {
            dead_letter.initialize()?;
        }
        Ok(())
    }

    pub fn submit(&mut self, request: Request) -> QueueResult<()> {
        self.queue.enqueue(request)
    }

    /// Success path: drop the request from the main queue.
    pub fn complete(&mut self, id: &RequestId) -> QueueResult<bool> {
        let removed = self.queue.remove(id)?;
        if removed {
            debug!("request {id} completed");
        }
        Ok(removed)
    }

    /// Route a failed attempt: retry it, dead-letter it, or drop it.
    pub fn handle_failed_request(
        &mut self,
        request: &Request,
        failure: &ExecutionFailure,
    ) -> QueueResult<FailureOutcome> {
        if self.policy.should_retry(request, failure) {
            let prepared = self
                .policy
                .prepare_for_retry(request, failure, self.clock.now());
            if !self.queue.update(prepared.clone())? {
                warn!("failed request {} is no longer queued", request.id);
                return Ok(FailureOutcome::NotQueued);
            }
            debug!(
                "request {} scheduled for retry {}/{} in {:?}: {failure}",
                prepared.id,
                prepared.retry_count,
                prepared.max_retries,
                prepared.retry_delay.unwrap_or_default()
            );
            return Ok(FailureOutcome::Retried(prepared));
        }

        let annotated = self.policy.annotate_failure(request, failure);
        self.evict(annotated)
    }

    /// Move every request that should no longer be retried out of the main queue.
    ///
    /// With a dead-letter store this covers exhausted and over-age requests;
    /// without one they are dropped.
    pub fn escalate_stale(&mut self) -> QueueResult<usize> {
        let now = self.clock.now();
        let terminal: Vec<Request> = self
            .queue
            .get_all()?
            .iter()
            .filter(|r| match self.dead_letter {
                Some(_) => self.policy.should_escalate(r, now),
                None => !r.can_retry() || self.policy.is_expired(r, now),
            })
            .cloned()
            .collect();

        let count = terminal.len();
        let mut first_error = None;
        for mut request in terminal {
            if request.failure_reason.is_none() {
                let reason = if request.can_retry() {
                    "request expired"
                } else {
                    "retries exhausted"
                };
                request.failure_reason = Some(reason.to_string());
            }
            if let Err(err) = self.evict(request) {
                first_error.get_or_insert(err);
            }
        }

        if count > 0 {
            info!("escalated {count} stale requests");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Drop main-queue and dead-letter entries past their configured max age.
    pub fn expire(&mut self) -> QueueResult<usize> {
        let now = self.clock.now();
        let max_age = self.queue.config().max_age;
        let mut expired = self.queue.cleanup_expired(now, max_age)?;
        if let Some(dead_letter) = self.dead_letter.as_mut() {
            let max_age = dead_letter.config().max_age;
            expired += dead_letter.cleanup_old(now, max_age)?;
        }
        Ok(expired)
    }

    /// Requests ready for an attempt now, in queue order.
    pub fn ready_for_retry(&self) -> QueueResult<Vec<Request>> {
        self.queue.get_ready_for_retry(self.clock.now())
    }

    /// Release a dead-lettered request and resubmit it with fresh retry bookkeeping.
    ///
    /// Returns `None` when there is no dead-letter store or no such entry. If
    /// the main queue rejects the request it is put back. A failed snapshot
    /// write is reported only after the request has reached one of the two
    /// collections.
    pub fn replay_dead_letter(&mut self, id: &RequestId) -> QueueResult<Option<Request>> {
        let Some(dead_letter) = self.dead_letter.as_mut() else {
            return Ok(None);
        };
        let Some(released) = dead_letter.get(id)?.cloned() else {
            return Ok(None);
        };
        let mut persistence_error = match dead_letter.retry(id) {
            Ok(_) => None,
            Err(err) if err.is_persistence_failure() => Some(err),
            Err(err) => return Err(err),
        };

        let mut replay = released.clone();
        replay.retry_count = 0;
        replay.last_retry_time = None;
        replay.retry_delay = None;
        replay.failure_reason = None;
        replay.last_status_code = None;
        replay.created_at = self.clock.now();

        match self.queue.enqueue(replay.clone()) {
            Ok(()) => {}
            Err(err) if err.is_persistence_failure() => {
                persistence_error.get_or_insert(err);
            }
            Err(err) => {
                warn!("could not replay request {id}: {err}");
                dead_letter.enqueue(released)?;
                return Err(err);
            }
        }

        if let Some(err) = persistence_error {
            return Err(err);
        }
        info!("replayed dead-lettered request {id}");
        Ok(Some(replay))
    }

    pub fn statistics(&self) -> QueueResult<CombinedStatistics> {
        let dead_letter = self
            .dead_letter
            .as_ref()
            .map(DeadLetterStore::statistics)
            .transpose()?;
        Ok(CombinedStatistics {
            generated_at: self.clock.now(),
            queue: self.queue.statistics()?,
            dead_letter,
        })
    }

    /// Dispose both stores, reporting the first failure.
    pub fn dispose(&mut self) -> QueueResult<()> {
        let queue = self.queue.dispose();
        let dead_letter = match self.dead_letter.as_mut() {
            Some(store) => store.dispose(),
            None => Ok(()),
        };
        queue.and(dead_letter)
    }

    /// Remove `request` from the main queue, dead-lettering it when possible.
    ///
    /// Both steps are attempted even if the first fails to persist.
    fn evict(&mut self, request: Request) -> QueueResult<FailureOutcome> {
        let id = request.id.clone();
        let stored = match self.dead_letter.as_mut() {
            Some(dead_letter) => dead_letter.enqueue(request),
            None => {
                warn!(
                    "dropping request {id}: {}",
                    request.failure_reason.as_deref().unwrap_or("unknown")
                );
                Ok(false)
            }
        };
        let removed = self.queue.remove(&id);
        let stored = stored?;
        removed?;
        Ok(if stored {
            FailureOutcome::DeadLettered
        } else {
            FailureOutcome::Dropped
        })
    }
}
