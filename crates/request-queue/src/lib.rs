//! Process-wide concurrency limit and retry loop for upstream provider calls
//!
//! Every outbound call goes through `RequestQueue::submit`:
//! 1. Caller waits (FIFO) for one of `max_concurrent` slots
//! 2. The operation runs with an `AttemptContext` (attempt number plus key
//!    selection), and returns a typed `Attempt` or `AttemptError` naming the
//!    key it used. An attempt cut off at its deadline is charged to the key
//!    it selected through the context
//! 3. Outcomes are reported back to the key pool
//! 4. Retriable failures (429, 5xx, timeouts, network) sleep with jittered
//!    exponential backoff and run again while holding the slot
//! 5. The slot is handed straight to the oldest waiter on completion

pub mod attempt;
pub mod backoff;
pub mod error;
pub mod queue;

pub use attempt::{Attempt, AttemptContext, AttemptError, FailureKind};
pub use backoff::Backoff;
pub use error::{Error, Result};
pub use queue::{QueueConfig, QueueStats, RequestQueue};
