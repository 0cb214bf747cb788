//! Health-aware pool of interchangeable provider API keys
//!
//! Selects keys round-robin while steering around keys that are rate limited or
//! failing. Two failure modes recover on independent timers:
//!
//! 1. Upstream returns 429 → key enters a fixed cooldown, skipped until it ends
//! 2. Key fails `max_failures` times in a row → skipped until `reset_window`
//!    has passed since its last failure, then eligible with a cleared counter
//! 3. Any success clears the consecutive failure counter (not the cooldown)
//! 4. Every key unhealthy → the least-recently-failed key is force-reset and
//!    handed out, so callers never stall on an empty pool

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{ErrorClassification, classify_status, is_rate_limit};
pub use error::{Error, Result};
pub use pool::{Credential, KeyHealth, KeyPool, KeyState, PoolConfig, PoolStatus};
