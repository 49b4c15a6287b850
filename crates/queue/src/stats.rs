//! Aggregate statistics for monitoring.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_core::Request;
use serde::Serialize;

/// Snapshot of the main queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub max_size: usize,
    /// `total / max_size` as a percentage.
    pub utilization_percent: f64,
    pub by_priority: BTreeMap<i32, usize>,
    pub by_method: BTreeMap<String, usize>,
    pub oldest_age: Option<Duration>,
    pub newest_age: Option<Duration>,
}

impl QueueStatistics {
    pub(crate) fn collect(requests: &[Request], max_size: usize, now: DateTime<Utc>) -> Self {
        let mut by_priority = BTreeMap::new();
        let mut by_method = BTreeMap::new();
        for request in requests {
            *by_priority.entry(request.priority).or_insert(0) += 1;
            *by_method.entry(request.method.clone()).or_insert(0) += 1;
        }

        let ages = requests.iter().map(|r| r.age(now));

        Self {
            total: requests.len(),
            max_size,
            utilization_percent: utilization(requests.len(), max_size),
            by_priority,
            by_method,
            oldest_age: ages.clone().max(),
            newest_age: ages.min(),
        }
    }
}

/// Snapshot of the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterStatistics {
    pub total: usize,
    pub max_size: usize,
    pub by_failure_reason: BTreeMap<String, usize>,
    pub by_status_code: BTreeMap<u16, usize>,
    pub by_method: BTreeMap<String, usize>,
    pub average_age: Option<Duration>,
    pub oldest_age: Option<Duration>,
}

impl DeadLetterStatistics {
    pub(crate) fn collect(requests: &[Request], max_size: usize, now: DateTime<Utc>) -> Self {
        let mut by_failure_reason = BTreeMap::new();
        let mut by_status_code = BTreeMap::new();
        let mut by_method = BTreeMap::new();
        let mut total_age = Duration::ZERO;
        let mut oldest_age: Option<Duration> = None;

        for request in requests {
            let reason = request
                .failure_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *by_failure_reason.entry(reason).or_insert(0) += 1;
            if let Some(code) = request.last_status_code {
                *by_status_code.entry(code).or_insert(0) += 1;
            }
            *by_method.entry(request.method.clone()).or_insert(0) += 1;

            let age = request.age(now);
            total_age = total_age.saturating_add(age);
            oldest_age = Some(oldest_age.map_or(age, |oldest| oldest.max(age)));
        }

        let average_age = u32::try_from(requests.len())
            .ok()
            .filter(|n| *n > 0)
            .map(|n| total_age / n);

        Self {
            total: requests.len(),
            max_size,
            by_failure_reason,
            by_status_code,
            by_method,
            average_age,
            oldest_age,
        }
    }
}

/// Main-queue and dead-letter statistics together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedStatistics {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueStatistics,
    /// `None` when no dead-letter store is configured.
    pub dead_letter: Option<DeadLetterStatistics>,
}

fn utilization(len: usize, max_size: usize) -> f64 {
    if max_size == 0 {
        return 100.0;
    }
    len as f64 * 100.0 / max_size as f64
}
