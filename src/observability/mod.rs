//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → stats (counters via the metrics facade)
//!
//! Consumers:
//!     → stderr or a log file (reopened on SIGHUP)
//!     → Prometheus scrape endpoint (when prometheus_port is set)
//! ```
//!
//! # Design Decisions
//! - The finished-session log line carries route, method, URI, code,
//!   bytes, duration, and upstream; From/User-Agent only when enabled
//! - Metrics are cheap (atomic increments); exposition is opt-in

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFile};
pub use metrics::init_metrics;
