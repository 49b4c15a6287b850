//! Retry decisions and backoff computation.
//!
//! The policy holds nothing but configuration; every decision is a pure
//! function of the request, the failure and the time passed in.

use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_core::{ErrorClass, ExecutionFailure, Request, describe_status};
use rand::Rng;

use crate::backoff::{MIN_DELAY, duration_from_secs_saturating};
use crate::config::RetryConfig;

/// Relative jitter applied around the computed delay.
pub const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, failure: &ExecutionFailure) -> ErrorClass {
        failure.classify()
    }

    /// Decide whether `request` should be attempted again after `failure`.
    ///
    /// 1. An exhausted retry budget never retries.
    /// 2. A request with its own retryable classes decides by classification alone.
    /// 3. A status code is checked against the allow-list, then the 5xx/4xx flags.
    /// 4. Without a status code, network-error retries accept transient classes.
    /// 5. Anything else retries.
    pub fn should_retry(&self, request: &Request, failure: &ExecutionFailure) -> bool {
        if !request.can_retry() {
            return false;
        }

        if request.retry_on_specific_errors {
            return request.retries_on(self.classify(failure));
        }

        if let Some(code) = failure.status_code {
            return self.allows_status(code);
        }

        if self.config.retry_on_network_errors {
            return self.classify(failure).is_transient();
        }

        true
    }

    fn allows_status(&self, code: u16) -> bool {
        if self.config.retry_status_codes.contains(&code) {
            return true;
        }
        match code {
            500..=599 => self.config.retry_on_server_errors,
            400..=499 => self.config.retry_on_client_errors,
            _ => false,
        }
    }

    /// Delay before the next attempt of `request`, keyed on its current retry count.
    ///
    /// Never exceeds the configured maximum delay, and never drops below
    /// [`MIN_DELAY`] unless that maximum is lower.
    pub fn compute_delay(&self, request: &Request) -> Duration {
        self.delay_for(request.retry_count)
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let strategy = self.config.strategy;
        let mut delay = strategy.base_delay(retry_count);

        if self.config.jitter || strategy.forces_jitter() {
            let offset = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
            delay = duration_from_secs_saturating(delay.as_secs_f64() * (1.0 + offset))
                .max(MIN_DELAY);
        }

        delay.min(self.config.max_delay)
    }

    /// Copy of `request` annotated for its next attempt.
    ///
    /// The retry count is incremented before the delay is computed, so the
    /// first retry waits one step of the strategy.
    pub fn prepare_for_retry(
        &self,
        request: &Request,
        failure: &ExecutionFailure,
        now: DateTime<Utc>,
    ) -> Request {
        let mut next = request.clone();
        next.retry_count = request.retry_count.saturating_add(1);
        next.last_retry_time = Some(now);
        next.retry_delay = Some(self.compute_delay(&next));
        next.failure_reason = Some(failure_reason(failure));
        next.last_status_code = failure.status_code;
        next
    }

    /// Copy of `request` annotated with its final failure, ready for the dead-letter store.
    pub fn annotate_failure(&self, request: &Request, failure: &ExecutionFailure) -> Request {
        let mut annotated = request.clone();
        annotated.failure_reason = Some(failure_reason(failure));
        annotated.last_status_code = failure.status_code;
        annotated
    }

    /// Whether `request` should leave the main queue for the dead-letter store.
    pub fn should_escalate(&self, request: &Request, now: DateTime<Utc>) -> bool {
        self.config.dead_letter_enabled
            && (!request.can_retry() || request.age(now) > self.config.max_request_age)
    }

    /// Whether `request` has outlived the maximum request age.
    pub fn is_expired(&self, request: &Request, now: DateTime<Utc>) -> bool {
        request.age(now) > self.config.max_request_age
    }
}

/// Human-readable reason: the status description when a code is present.
fn failure_reason(failure: &ExecutionFailure) -> String {
    match failure.status_code {
        Some(code) => describe_status(code),
        None => failure.description.clone(),
    }
}
