//! RPC over the message bus.
//!
//! # Data Flow
//! ```text
//! client.rs (we call the handler):
//!     inspect/accept → DEALER [empty][frame {id, method, args}]
//!     reply          → [empty][frame {id, success, value|condition}]
//!     deadline per call; late replies discarded by id
//!
//! command.rs (the handler calls us):
//!     conncheck/refresh/report → ROUTER [peer][empty][frame]
//! ```
//!
//! # Design Decisions
//! - The outstanding set is bounded; a full set degrades per policy
//!   (inspect → permit, accept → 502) instead of queueing unboundedly
//! - Timers and reply routing belong to the engine; this module only
//!   owns sockets, framing, and the id → call map

pub mod client;
pub mod command;

pub use client::{RpcClient, RpcError};
pub use command::CommandServer;
