//! The deferred request and its retry bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::ErrorClass;
use crate::id::RequestId;

/// Opaque caller data attached to a request. Never inspected by the queue.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Default retry budget for requests built with [`Request::new`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A deferred operation waiting for delivery.
///
/// Serialised with the snapshot field names (`url`, `createdAt`,
/// `lastFailureStatusCode`, ...). Callers must not mutate a request while it
/// is queued; updates go through the queue so ordering is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Higher sorts first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub last_retry_time: Option<DateTime<Utc>>,
    /// Backoff imposed by the retry policy, serialised as milliseconds.
    #[serde(default, with = "duration_millis")]
    pub retry_delay: Option<Duration>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default, rename = "lastFailureStatusCode")]
    pub last_status_code: Option<u16>,
    #[serde(default)]
    pub retryable_error_types: BTreeSet<String>,
    /// When set, only failures classified into `retryable_error_types` are retried.
    #[serde(default)]
    pub retry_on_specific_errors: bool,
}

impl Request {
    /// Create a request with a generated id, created now.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            metadata: None,
            last_retry_time: None,
            retry_delay: None,
            failure_reason: None,
            last_status_code: None,
            retryable_error_types: BTreeSet::new(),
            retry_on_specific_errors: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Restrict retries to failures of the given classes.
    pub fn with_retryable_errors(mut self, classes: impl IntoIterator<Item = ErrorClass>) -> Self {
        self.retryable_error_types = classes
            .into_iter()
            .map(|class| class.as_str().to_string())
            .collect();
        self.retry_on_specific_errors = true;
        self
    }

    /// Whether the retry budget is not yet exhausted.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Time since creation; zero if `created_at` lies in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Whether the request may be attempted at `now`: budget left and backoff elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if !self.can_retry() {
            return false;
        }
        match self.last_retry_time {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or_default();
                elapsed >= self.retry_delay.unwrap_or_default()
            }
        }
    }

    /// Whether the failure class is one this request explicitly retries.
    pub fn retries_on(&self, class: ErrorClass) -> bool {
        self.retryable_error_types.contains(class.as_str())
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
