//! Outbound connection pooling and round-trip calls.
//!
//! A `Transport` talks to one logical service reachable at one or more
//! remote addresses. Idle stream connections are kept per address in
//! bounded free lists inside a concurrent map, so unrelated addresses
//! never contend. Datagram connections are never pooled.
//!
//! Address selection walks the configured remotes in order: an idle pooled
//! connection wins, otherwise a fresh connect is attempted with a bounded
//! timeout, and a failure moves on to the next address. Running out of
//! addresses is the one error a caller has to handle.

use crate::error::Error;
use crate::runtime::buffer::{BufferChain, BufferPool};
use crate::runtime::connection::{Connection, ConnectionKind};
use bytes::BytesMut;
use dashmap::DashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream as StdTcpStream, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

type IdleQueue = Arc<Mutex<Vec<Arc<Connection>>>>;

/// Outbound connection settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Idle connections kept per remote address.
    pub pool_size: usize,
    /// Upper bound for establishing one connection.
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            connect_timeout: Duration::from_secs(2),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Pooled client for one logical service.
pub struct Transport {
    name: String,
    kind: ConnectionKind,
    remotes: Vec<SocketAddr>,
    buffers: Arc<BufferPool>,
    idle: DashMap<SocketAddr, IdleQueue>,
    config: TransportConfig,
}

impl Transport {
    /// Create a transport for `remotes`, tried in the given order.
    ///
    /// Duplicate addresses are dropped.
    pub fn new(
        name: impl Into<String>,
        kind: ConnectionKind,
        remotes: impl IntoIterator<Item = SocketAddr>,
        buffers: Arc<BufferPool>,
        config: TransportConfig,
    ) -> Self {
        let mut unique = Vec::new();
        for addr in remotes {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Self {
            name: name.into(),
            kind,
            remotes: unique,
            buffers,
            idle: DashMap::new(),
            config,
        }
    }

    /// Merge several transports of the same kind into one.
    ///
    /// Remote addresses are unioned in first-seen order. The combined name
    /// is the sorted constituent names joined with `;`, so the same set of
    /// transports always yields the same name. Buffers and settings come
    /// from the first transport.
    pub fn combine(transports: &[Transport]) -> Result<Transport, Error> {
        let first = transports
            .first()
            .ok_or(Error::InvalidState("no transports to combine"))?;
        if transports.iter().any(|t| t.kind != first.kind) {
            return Err(Error::InvalidState("cannot combine transports of different kinds"));
        }

        let mut names: Vec<&str> = transports.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();

        Ok(Transport::new(
            names.join(";"),
            first.kind,
            transports.iter().flat_map(|t| t.remotes.iter().copied()),
            Arc::clone(&first.buffers),
            first.config.clone(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote_addrs(&self) -> &[SocketAddr] {
        &self.remotes
    }

    /// Borrow a buffer for composing a request.
    pub fn poll_buffer(&self) -> BytesMut {
        self.buffers.get()
    }

    /// Idle pooled connections for `addr`.
    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        match self.idle.get(&addr) {
            Some(queue) => lock(queue.value()).len(),
            None => 0,
        }
    }

    /// Get a connection to `addr`, or to the first reachable configured
    /// remote when `addr` is `None`.
    pub async fn poll_connection(&self, addr: Option<SocketAddr>) -> Result<Arc<Connection>, Error> {
        let candidates = match addr {
            Some(addr) => vec![addr],
            None => self.remotes.clone(),
        };
        if candidates.is_empty() {
            return Err(Error::InvalidState("transport has no remote addresses"));
        }

        for &remote in &candidates {
            if let Some(connection) = self.take_idle(remote) {
                trace!(remote = %remote, "Reusing pooled connection");
                return Ok(connection);
            }
            match self.connect(remote).await {
                Ok(connection) => return Ok(Arc::new(connection)),
                Err(e) => {
                    debug!(transport = %self.name, remote = %remote, error = %e, "Connect failed");
                }
            }
        }

        warn!(transport = %self.name, "No remote address reachable");
        Err(Error::Unreachable(candidates))
    }

    /// Return a connection after use.
    ///
    /// Open stream connections of this transport's kind are pooled unless
    /// `force_close` is set; everything else is disposed.
    pub fn offer_connection(&self, force_close: bool, connection: Arc<Connection>) {
        if force_close
            || !connection.kind().is_stream()
            || connection.kind() != self.kind
            || connection.is_closed()
        {
            connection.dispose();
            return;
        }

        let remote = connection.remote_addr();
        let queue = Arc::clone(
            self.idle
                .entry(remote)
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .value(),
        );
        let mut idle = lock(&queue);
        if idle.len() >= self.config.pool_size.max(1) {
            drop(idle);
            trace!(remote = %remote, "Idle pool full, closing connection");
            connection.dispose();
            return;
        }
        idle.push(connection);
    }

    /// Send `request` and hand the response bytes to `on_response`.
    ///
    /// The response is whatever a single read returns, read into the request
    /// buffer once it has been written. The buffer goes back to the pool in
    /// every case; the connection is pooled on success and closed on failure.
    pub async fn call<R>(
        &self,
        addr: Option<SocketAddr>,
        request: BytesMut,
        on_response: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, Error> {
        let connection = match self.poll_connection(addr).await {
            Ok(connection) => connection,
            Err(e) => {
                self.buffers.offer(request);
                return Err(e);
            }
        };

        let mut returned = None;
        let written = connection
            .write_all(BufferChain::from(request), |buf| returned = Some(buf))
            .await;
        if let Err(e) = written {
            if let Some(buf) = returned {
                self.buffers.offer(buf);
            }
            self.offer_connection(true, connection);
            return Err(e.into());
        }
        let Some(mut buf) = returned else {
            self.offer_connection(true, connection);
            return Err(Error::InvalidState("request buffer was not returned"));
        };

        buf.clear();
        let (result, buf) = connection.read(buf).await;
        let outcome = match result {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote closed before responding",
            )),
            Ok(_) => Ok(on_response(&buf)),
            Err(e) => Err(e),
        };
        self.buffers.offer(buf);

        match outcome {
            Ok(response) => {
                self.offer_connection(false, connection);
                Ok(response)
            }
            Err(e) => {
                debug!(transport = %self.name, remote = %connection.remote_addr(), error = %e, "Call failed");
                self.offer_connection(true, connection);
                Err(e.into())
            }
        }
    }

    fn take_idle(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        let queue = self.idle.get(&remote).map(|queue| Arc::clone(queue.value()))?;
        let mut idle = lock(&queue);
        while let Some(connection) = idle.pop() {
            if connection.is_open() {
                return Some(connection);
            }
            connection.dispose();
        }
        None
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<Connection> {
        let limit = self.config.connect_timeout.max(Duration::from_millis(1));
        let connection = match self.kind {
            ConnectionKind::NativeStream => {
                let stream = tokio::time::timeout(limit, tokio::net::TcpStream::connect(remote))
                    .await
                    .map_err(|_| connect_timed_out(remote))??;
                stream.set_nodelay(true)?;
                Connection::from_tcp(stream)?
            }
            ConnectionKind::BlockingStream => {
                let stream = tokio::task::spawn_blocking(move || {
                    let stream = StdTcpStream::connect_timeout(&remote, limit)?;
                    stream.set_nodelay(true)?;
                    Ok::<_, io::Error>(stream)
                })
                .await
                .map_err(io::Error::other)??;
                Connection::blocking(stream)?
            }
            ConnectionKind::Datagram => {
                let local: SocketAddr = if remote.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                Connection::datagram(Arc::new(UdpSocket::bind(local)?), remote, true)
            }
        };

        connection.set_read_timeout(self.config.read_timeout);
        connection.set_write_timeout(self.config.write_timeout);
        debug!(transport = %self.name, remote = %remote, kind = ?self.kind, "Opened outbound connection");
        Ok(connection)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connect_timed_out(remote: SocketAddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connect to {remote} timed out"),
    )
}
