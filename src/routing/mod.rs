//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! routes file / --route lines
//!     → route.rs (parse each line into a compiled Route)
//!     → domain_map.rs (immutable RouteSet snapshot)
//!
//! Incoming request (host, path)
//!     → DomainMap::lookup
//!     → Return: Arc<Route> or None (502 to client)
//!
//! SIGHUP / file change
//!     → DomainMap::reload (atomic snapshot swap)
//!     → observers → routes-changed fan-out to workers
//! ```
//!
//! # Design Decisions
//! - Routes compiled at parse time, immutable at runtime
//! - Sessions capture their route by Arc and keep it across reloads
//! - Deterministic: same input always matches the same route

pub mod domain_map;
pub mod route;

pub use domain_map::{DomainMap, RouteSet};
pub use route::{Route, RouteParseError, Target};
