//! `deferq-core`: model and ports for the durable retry queue.
//!
//! This crate contains the request model, failure classification, error
//! types and the two external ports the queue consumes (clock and key-value
//! store). It holds no queue logic.

pub mod clock;
pub mod error;
pub mod failure;
pub mod id;
pub mod request;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{QueueError, QueueResult, StoreError};
pub use failure::{ErrorClass, ExecutionFailure, describe_status};
pub use id::RequestId;
pub use request::{DEFAULT_MAX_RETRIES, Metadata, Request};
pub use store::{FileStore, InMemoryStore, KeyValueStore};
