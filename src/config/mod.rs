//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → Config (validated, immutable)
//!     → engine.rs derives one EngineConfig per worker
//!
//! On SIGHUP or routes-file change:
//!     watcher.rs / lifecycle detects change
//!     → domain map reloads and swaps its snapshot
//!     → workers observe the new snapshot via routes-changed fan-out
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the routes file hot-reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{Config, GlobalConfig, ProxySection, RunnerConfig, XffRule};
