//! Networking runtime.
//!
//! Layered bottom-up:
//! - `pool`, `buffer`: bounded object pools and pooled byte buffers
//! - `connection`: one peer-facing channel over native async, blocking or
//!   datagram sockets
//! - `listener`: server-side accept/receive loops
//! - `exchange`, `dispatcher`: the request/response state machine
//! - `transport`: pooled outbound connections with address failover
//!
//! Pools and runtime handles are passed in explicitly; nothing here is a
//! process-wide singleton.

pub mod buffer;
pub mod connection;
pub mod dispatcher;
pub mod exchange;
pub mod listener;
pub mod pool;
pub mod transport;

pub use buffer::{BufferChain, BufferPool};
pub use connection::{BufResult, Connection, ConnectionKind};
pub use dispatcher::{Dispatcher, ExchangeConfig};
pub use exchange::{
    Exchange, ExchangeSnapshot, FrameStatus, Protocol, Request, Response, Servlet, ServletError,
};
pub use listener::{Dispatch, Listener};
pub use pool::{ObjectPool, PoolStats};
pub use transport::{Transport, TransportConfig};
