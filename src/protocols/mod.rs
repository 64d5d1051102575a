//! Protocol implementations.
//!
//! Each protocol supplies framing hooks (`runtime::Protocol`) and a servlet
//! (`runtime::Servlet`) that the dispatcher drives.
//!
//! - `echo`: length-prefixed echo service for throughput and I/O testing

pub mod echo;
