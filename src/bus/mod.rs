//! Message-bus transport subsystem.
//!
//! # Data Flow
//! ```text
//! endpoint specs (tcp://host:port, ipc:///path)
//!     → spec.rs (parse, per-worker ipc suffixing)
//!     → socket.rs (socket role, bind/connect, ipc file mode)
//!     → engine registers each socket's fd with the event loop
//!     → on readiness: drain all pending multipart messages
//! ```
//!
//! # Design Decisions
//! - Delivery is best-effort, FIFO per peer; lost peers surface as
//!   keep-alive timeouts at the ZHTTP layer, not here
//! - Sends never block: a message the transport cannot take immediately
//!   is queued and flushed when the socket becomes writable
//! - The transport fd is a readiness *hint*; consumers must re-check the
//!   socket's event mask after every operation

pub mod socket;
pub mod spec;

pub use socket::{BusError, BusSocket};
pub use spec::{ipc_path, suffix_spec, suffix_specs, SpecInfo};
