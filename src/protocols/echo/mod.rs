//! Echo protocol implementation.
//!
//! A simple echo service for throughput and I/O testing:
//! - Client sends: `<length>\r\n<data>`
//! - Server echoes: `<length>\r\n<data>`
//!
//! ## Protocol Format
//!
//! Length-prefixed binary protocol for predictable framing:
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! Special commands (line-based):
//! - `QUIT\r\n` - Answered with `OK\r\n`, then the connection is closed
//!
//! Every echo frame asks for keep-alive. An invalid or oversized length
//! closes the connection. Over UDP each datagram must hold a whole frame.

pub mod framing;
pub mod parser;
pub mod servlet;

pub use framing::{EchoFrame, EchoProtocol, MAX_ECHO_SIZE};
pub use servlet::EchoServlet;
