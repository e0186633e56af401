//! ZHTTP request/response engine.
//!
//! # Data Flow
//! ```text
//! bus frame ("T..."/"J...")
//!     → packet.rs (decode to ZhttpPacket)
//!     → transaction.rs (per-id state machine, credit accounting)
//!     → session layer (proxy semantics)
//!
//! outgoing:
//!     transaction produces ZhttpPacket
//!     → packet.rs (encode)
//!     → engine wraps in the multipart envelope and picks the socket
//! ```
//!
//! # Design Decisions
//! - Transactions never see sockets; the engine owns addressing, so the
//!   state machines stay unit-testable
//! - A server transaction is identified by (from, id); a client
//!   transaction by id alone
//! - Credits are byte-granular and monotonic for a transaction's life

pub mod packet;
pub mod tnetstring;
pub mod transaction;

pub use packet::{get_header, Header, PacketType, PayloadFormat, ZhttpPacket};
pub use tnetstring::Value;
pub use transaction::{
    ClientEvent, ClientTransaction, HandoffState, RequestData, ResponseData, ServerEvent,
    ServerTransaction, TransactionError, TransactionState, DEFAULT_TIMEOUT,
};
