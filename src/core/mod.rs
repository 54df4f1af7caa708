//! Core functionality for the IP guard service.
//!
//! This module contains the request-path components (rate limiter and block
//! list gate), the offline suspicion pipeline (classifier, escalator and
//! expiry sweep) and the storage ports they share.

pub mod block_list;
pub mod classifier;
pub mod clock;
pub mod escalator;
pub mod expiry;
pub mod identity;
pub mod memory;
pub mod policy;
pub mod rate_limiter;
pub mod redis_store;
pub mod scheduler;
pub mod store;
pub mod suspicion;

pub use block_list::{BlockListGate, BlockOutcome};
pub use classifier::{ClassificationSummary, Classifier, ClassifierConfig, ClassifierError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use escalator::{EscalationSummary, Escalator};
pub use expiry::{ExpirySummary, ExpirySweeper};
pub use identity::{IdentityError, RateLimitKey, RateLimitScope};
pub use policy::{Decision, FailurePolicy};
pub use rate_limiter::RateLimiter;
pub use redis_store::RedisStore;
pub use scheduler::{Jobs, Task, TaskReport};
pub use suspicion::{SuspicionFlag, SuspicionReason};
