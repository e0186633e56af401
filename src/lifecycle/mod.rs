//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! SIGINT/SIGTERM → signal thread → self-pipe → main loop callback
//!     → ordered shutdown: stop workers (deferred call) → join → exit 0
//!     → a second SIGINT/SIGTERM exits immediately with code 1
//!
//! SIGHUP → routes reload + log rotation; never terminates
//! ```
//!
//! # Design Decisions
//! - Handlers are installed once, on the main thread, before workers
//! - The signal thread only writes a byte; all real work happens on the
//!   main event loop

pub mod signals;

pub use signals::{Signal, SignalListener};
