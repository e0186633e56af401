//! Realtime reverse proxy worker core.
//!
//! Accepts ZHTTP-framed client requests from a connection manager,
//! routes them, dispatches to origins, and hands held responses off to
//! the handler process that owns long-lived subscriptions.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌────────────────────────────────────────────────────────┐
//!                │                    PROXY WORKER                        │
//!                │                                                        │
//!  connection    │  ┌─────────┐   ┌─────────┐   ┌─────────┐   ┌────────┐ │
//!  manager ──────┼─▶│   bus   │──▶│  zhttp  │──▶│ session │──▶│routing │ │
//!  (ZHTTP/zmq)   │  │ sockets │   │  engine │   │  state  │   │ domain │ │
//!                │  └─────────┘   └─────────┘   │ machine │   │  map   │ │
//!                │                              └────┬────┘   └────────┘ │
//!                │                                   │                   │
//!                │              hold? ┌──────────────┼───────────┐       │
//!  handler ◀─────┼────accept RPC─────┘              ▼           ▼       │
//!  (inspect/     │                            ┌──────────┐ ┌──────────┐ │
//!   accept)      │                            │   load   │ │  zhttp   │ │
//!                │                            │ balancer │ │  client  │─┼──▶ origin
//!                │                            └──────────┘ └──────────┘ │   (via connmgr)
//!                │                                                        │
//!                │  ┌──────────────────────────────────────────────────┐ │
//!                │  │            Cross-Cutting Concerns                 │ │
//!                │  │  ┌────────┐ ┌───────┐ ┌─────────┐ ┌───────────┐  │ │
//!                │  │  │ config │ │ stats │ │ observ- │ │ lifecycle │  │ │
//!                │  │  │        │ │       │ │ ability │ │ + signals │  │ │
//!                │  │  └────────┘ └───────┘ └─────────┘ └───────────┘  │ │
//!                │  │  ┌─────────────────┐  ┌────────────────────────┐ │ │
//!                │  │  │   resilience    │  │  event loop + defer    │ │ │
//!                │  │  │ retry/backoff   │  │  (one per worker)      │ │ │
//!                │  │  └─────────────────┘  └────────────────────────┘ │ │
//!                │  └──────────────────────────────────────────────────┘ │
//!                └────────────────────────────────────────────────────────┘
//! ```
//!
//! Each worker is one OS thread running one event loop and one engine;
//! there is no shared mutable state between workers beyond the atomic
//! routes snapshot.

// Core subsystems
pub mod bus;
pub mod config;
pub mod engine;
pub mod routing;
pub mod session;
pub mod zhttp;

// Traffic management
pub mod load_balancer;
pub mod rpc;
pub mod stats;

// Runtime
pub mod defer;
pub mod event_loop;
pub mod worker;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::{load_config, Config};
pub use engine::{Engine, EngineConfig};
pub use routing::DomainMap;
pub use worker::Supervisor;
