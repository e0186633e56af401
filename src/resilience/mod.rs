//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream dispatch fails before any response byte reached the client:
//!     → retries.rs (is another attempt allowed?)
//!     → backoff.rs (how long to wait)
//!     → load_balancer cooldown keeps the failed target out of rotation
//! ```
//!
//! # Design Decisions
//! - A session retries at most `retry_max` times, never after the first
//!   response byte has been forwarded
//! - Backoff is exponential with jitter to avoid retry synchronization

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::RetryPolicy;
