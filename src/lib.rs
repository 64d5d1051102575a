//! grow-a-server: a protocol-agnostic networking core.
//!
//! - One connection abstraction over native async sockets, blocking sockets
//!   and datagrams
//! - Accept/receive loops that dispatch peers to a request/response state
//!   machine with keep-alive reuse
//! - Pooled buffers, exchange objects and outbound connections
//! - A client transport with per-address pooling and failover
//!
//! Wire formats and business logic plug in through `runtime::Protocol` and
//! `runtime::Servlet`; `protocols::echo` is the bundled example.

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use error::Error;
