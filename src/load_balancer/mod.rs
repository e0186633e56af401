//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → targets identified
//!     → round_robin.rs (weighted rotation, cooldown skip)
//!     → Return target or None (route has no usable upstream)
//! ```
//!
//! # Design Decisions
//! - Selection state is per worker; workers do not coordinate picks
//! - A failing target sits out a cooldown window instead of being
//!   permanently evicted
//! - When every target is cooling down, cooldowns are ignored: a bad
//!   guess beats refusing outright

pub mod round_robin;

pub use round_robin::TargetPicker;
