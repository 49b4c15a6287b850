//! `deferq-queue`: durable, priority-ordered retry queue.
//!
//! The [`RetryManager`] owns a [`DurableOrderedQueue`] and an optional
//! [`DeadLetterStore`] and routes failed attempts through the
//! [`RetryPolicy`]. A [`Processor`] drives passes over the ready requests
//! with a caller-supplied [`RequestExecutor`].

pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod manager;
pub mod ordered_queue;
pub mod policy;
pub mod processor;
pub mod snapshot;
pub mod stats;

pub use backoff::{DelayStrategy, MIN_DELAY};
pub use config::{
    ConfigError, DeadLetterConfig, DeferqConfig, ProcessorConfig, QueueConfig, RetryConfig,
};
pub use dead_letter::{DeadLetterExport, DeadLetterStore};
pub use manager::{FailureOutcome, RetryManager};
pub use ordered_queue::DurableOrderedQueue;
pub use policy::{JITTER_RATIO, RetryPolicy};
pub use processor::{PassReport, Processor, ProcessorHandle, RequestExecutor, SkipReason};
pub use snapshot::Lifecycle;
pub use stats::{CombinedStatistics, DeadLetterStatistics, QueueStatistics};
