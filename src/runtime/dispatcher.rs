//! Exchange dispatcher.
//!
//! Drives one exchange per cycle on a connection:
//!
//! ```text
//! Acquire -> ReadHeader -> [ReadBody]* -> Execute -> Respond -> Recycle
//!                                                                  |
//!            (keep-alive, connection open) <-----------------------+
//! ```
//!
//! Every cycle runs as its own task on the worker runtime, so the next
//! exchange on a kept-alive connection only starts after the previous one has
//! been fully recycled. Faults never leave the dispatcher: they are counted,
//! logged, and end with the connection closed.

use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::Connection;
use crate::runtime::exchange::{
    Exchange, ExchangeSnapshot, ExchangeStats, FrameStatus, Protocol, Request, Servlet,
};
use crate::runtime::listener::Dispatch;
use crate::runtime::pool::{ObjectPool, PoolStats};
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Per-exchange settings.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Applied to every dispatched connection. `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Idle exchange objects kept for reuse.
    pub pool_size: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            pool_size: 256,
        }
    }
}

/// Why an exchange ended early.
#[derive(Debug)]
enum Fault {
    /// Header rejected by the protocol.
    Malformed,
    /// Peer stopped mid-frame.
    Incomplete,
    /// A datagram that claims more body than it carries.
    Truncated,
    /// End of stream before any byte of a new frame.
    PeerClosed,
    /// A read exceeded the connection's read timeout.
    Timeout(io::Error),
    /// Read failure or premature end of stream.
    Io(io::Error),
    /// Servlet returned an error or panicked.
    Servlet(String),
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Fault::Timeout(e),
            _ => Fault::Io(e),
        }
    }
}

/// Runs exchanges for one protocol and servlet.
pub struct Dispatcher<P: Protocol> {
    protocol: P,
    servlet: Arc<dyn Servlet<P>>,
    buffers: Arc<BufferPool>,
    exchanges: ObjectPool<Box<Exchange<P>>>,
    stats: Arc<ExchangeStats>,
    config: ExchangeConfig,
    handle: Handle,
}

impl<P: Protocol> Dispatcher<P> {
    /// Create a dispatcher whose cycles run on `handle`.
    pub fn new(
        protocol: P,
        servlet: impl Servlet<P>,
        buffers: Arc<BufferPool>,
        config: ExchangeConfig,
        handle: Handle,
    ) -> Arc<Self> {
        let stats = Arc::new(ExchangeStats::default());
        let exchanges = {
            let buffers = Arc::clone(&buffers);
            let stats = Arc::clone(&stats);
            ObjectPool::new(
                config.pool_size,
                move || Box::new(Exchange::new(Arc::clone(&buffers), Arc::clone(&stats))),
                |exchange: &mut Box<Exchange<P>>| !exchange.is_active(),
            )
        };

        Arc::new(Self {
            protocol,
            servlet: Arc::new(servlet),
            buffers,
            exchanges,
            stats,
            config,
            handle,
        })
    }

    /// Start serving a stream connection.
    pub fn serve(self: &Arc<Self>, connection: Arc<Connection>) {
        connection.set_read_timeout(self.config.read_timeout);
        connection.set_write_timeout(self.config.write_timeout);
        self.spawn_cycle(connection, None);
    }

    /// Serve one received datagram as a complete frame.
    pub fn serve_datagram(self: &Arc<Self>, connection: Arc<Connection>, datagram: BytesMut) {
        connection.set_write_timeout(self.config.write_timeout);
        self.spawn_cycle(connection, Some(datagram));
    }

    pub fn stats(&self) -> ExchangeSnapshot {
        self.stats.snapshot()
    }

    pub fn exchange_pool_stats(&self) -> PoolStats {
        self.exchanges.stats()
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    fn spawn_cycle(self: &Arc<Self>, connection: Arc<Connection>, datagram: Option<BytesMut>) {
        let this = Arc::clone(self);
        self.handle.spawn(this.cycle(connection, datagram));
    }

    fn cycle(
        self: Arc<Self>,
        connection: Arc<Connection>,
        datagram: Option<BytesMut>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut exchange = self.exchanges.get();
            exchange.init(Arc::clone(&connection));

            let kill = match self.run(&mut exchange, &connection, datagram).await {
                Ok(()) => exchange.response.finished().unwrap_or_else(|| {
                    warn!(peer = %connection.remote_addr(), "Servlet returned without finishing the response");
                    true
                }),
                Err(fault) => {
                    self.record(&connection, fault);
                    true
                }
            };

            if kill {
                exchange.request.refuse_alive();
            }
            let keep_alive = exchange.request.keep_alive()
                && connection.kind().is_stream()
                && connection.is_open();

            exchange.recycle(&self.protocol);
            self.exchanges.offer(exchange);

            if keep_alive {
                self.spawn_cycle(connection, None);
            } else {
                connection.dispose();
            }
        }
        .boxed()
    }

    async fn run(
        &self,
        exchange: &mut Exchange<P>,
        connection: &Connection,
        datagram: Option<BytesMut>,
    ) -> Result<(), Fault> {
        let request = &mut exchange.request;
        match datagram {
            Some(mut buf) => {
                let status = self.protocol.read_header(request, &mut buf);
                self.buffers.offer(buf);
                match status {
                    FrameStatus::Complete => {}
                    FrameStatus::NeedBody(_) => return Err(Fault::Truncated),
                    FrameStatus::Malformed => return Err(Fault::Malformed),
                    FrameStatus::Incomplete => return Err(Fault::Incomplete),
                }
            }
            None => {
                let (result, mut buf) = connection.read(self.buffers.get()).await;
                match result {
                    Ok(0) => {
                        self.buffers.offer(buf);
                        return Err(Fault::PeerClosed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.buffers.offer(buf);
                        return Err(e.into());
                    }
                }

                match self.protocol.read_header(request, &mut buf) {
                    FrameStatus::Complete => self.buffers.offer(buf),
                    FrameStatus::NeedBody(needed) => {
                        self.read_body(request, connection, buf, needed).await?
                    }
                    FrameStatus::Malformed => {
                        self.buffers.offer(buf);
                        return Err(Fault::Malformed);
                    }
                    FrameStatus::Incomplete => {
                        self.buffers.offer(buf);
                        return Err(Fault::Incomplete);
                    }
                }
            }
        }

        self.execute(exchange).await
    }

    /// Read until `remaining` body bytes have been consumed. Returns `buf`
    /// to the pool on every path.
    async fn read_body(
        &self,
        request: &mut Request<P>,
        connection: &Connection,
        mut buf: BytesMut,
        mut remaining: usize,
    ) -> Result<(), Fault> {
        while remaining > 0 {
            buf.clear();
            let (result, returned) = connection.read(buf).await;
            buf = returned;
            let fault = match result {
                Ok(0) => Fault::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed with {remaining} body bytes outstanding"),
                )),
                Ok(_) => match self.protocol.read_body(request, &mut buf) {
                    0 => Fault::Malformed,
                    consumed => {
                        remaining = remaining.saturating_sub(consumed);
                        continue;
                    }
                },
                Err(e) => e.into(),
            };
            self.buffers.offer(buf);
            return Err(fault);
        }
        self.buffers.offer(buf);
        Ok(())
    }

    async fn execute(&self, exchange: &mut Exchange<P>) -> Result<(), Fault> {
        let Exchange { request, response } = exchange;
        self.protocol.prepare(request);
        self.stats.exchanges.fetch_add(1, Ordering::Relaxed);

        match AssertUnwindSafe(self.servlet.execute(request, response))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Fault::Servlet(e.to_string())),
            Err(panic) => Err(Fault::Servlet(panic_message(panic.as_ref()))),
        }
    }

    fn record(&self, connection: &Connection, fault: Fault) {
        let peer = connection.remote_addr();
        match fault {
            Fault::Malformed | Fault::Truncated => {
                self.stats.ill_requests.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, reason = ?fault, "Rejected malformed frame");
            }
            Fault::Incomplete => {
                debug!(peer = %peer, "Peer sent an incomplete frame");
            }
            Fault::PeerClosed => {
                self.stats.peer_closes.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, "Peer closed connection");
            }
            Fault::Timeout(e) => {
                self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, error = %e, "Exchange timed out");
            }
            Fault::Io(e) => {
                self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, error = %e, "Exchange I/O failed");
            }
            Fault::Servlet(message) => {
                self.stats.servlet_faults.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, error = %message, "Servlet failed");
            }
        }
    }
}

impl<P: Protocol> Dispatch for Dispatcher<P> {
    fn on_stream(self: Arc<Self>, connection: Arc<Connection>) {
        self.serve(connection);
    }

    fn on_datagram(self: Arc<Self>, connection: Arc<Connection>, datagram: BytesMut) {
        self.serve_datagram(connection, datagram);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "servlet panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::exchange::{Response, ServletError};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// `<len>\n<body>`; every frame asks for keep-alive.
    #[derive(Default)]
    struct LengthLines {
        body_reads: AtomicUsize,
    }

    #[derive(Default)]
    struct Frame {
        body: Vec<u8>,
        remaining: usize,
    }

    impl Protocol for LengthLines {
        type Frame = Frame;

        fn read_header(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> FrameStatus {
            let Some(end) = buf.iter().position(|&b| b == b'\n') else {
                return FrameStatus::Incomplete;
            };
            let Some(len) = std::str::from_utf8(&buf[..end])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
            else {
                return FrameStatus::Malformed;
            };

            request.set_keep_alive(true);
            let available = (buf.len() - end - 1).min(len);
            let frame = request.frame_mut();
            frame.body.extend_from_slice(&buf[end + 1..end + 1 + available]);
            frame.remaining = len - available;
            match frame.remaining {
                0 => FrameStatus::Complete,
                n => FrameStatus::NeedBody(n),
            }
        }

        fn read_body(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> usize {
            self.body_reads.fetch_add(1, Ordering::SeqCst);
            let frame = request.frame_mut();
            let take = frame.remaining.min(buf.len());
            frame.body.extend_from_slice(&buf[..take]);
            frame.remaining -= take;
            take
        }
    }

    enum Behavior {
        Echo,
        Panic,
        Silent,
    }

    struct Recording {
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
        connections: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Servlet<LengthLines> for Recording {
        async fn execute(
            &self,
            request: &mut Request<LengthLines>,
            response: &mut Response<LengthLines>,
        ) -> Result<(), ServletError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(conn) = request.connection() {
                self.connections
                    .lock()
                    .unwrap()
                    .push(Arc::as_ptr(conn) as usize);
            }
            match self.behavior {
                Behavior::Echo => {
                    let body = std::mem::take(&mut request.frame_mut().body);
                    response.finish_with_bytes(&body).await?;
                }
                Behavior::Panic => panic!("servlet exploded"),
                Behavior::Silent => {}
            }
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher<LengthLines>>,
        calls: Arc<AtomicUsize>,
        connections: Arc<Mutex<Vec<usize>>>,
    }

    fn harness(behavior: Behavior, config: ExchangeConfig) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let servlet = Recording {
            behavior,
            calls: Arc::clone(&calls),
            connections: Arc::clone(&connections),
        };
        let buffers = Arc::new(BufferPool::new(16, 4096));
        let dispatcher = Dispatcher::new(
            LengthLines::default(),
            servlet,
            buffers,
            config,
            Handle::current(),
        );
        Harness {
            dispatcher,
            calls,
            connections,
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000))
    }

    async fn wait_closed(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("connection was not closed");
    }

    #[tokio::test]
    async fn test_keep_alive_reuses_connection() {
        let h = harness(Behavior::Echo, ExchangeConfig::default());
        let (server, mut client) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::native(server, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));

        for payload in [&b"hello"[..], &b"abc"[..], &b"z"[..]] {
            let header = format!("{}\n", payload.len());
            client.write_all(header.as_bytes()).await.unwrap();
            client.write_all(payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }

        drop(client);
        wait_closed(&conn).await;

        let seen = h.connections.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&p| p == Arc::as_ptr(&conn) as usize));

        let stats = h.dispatcher.stats();
        assert_eq!(stats.exchanges, 3);
        assert_eq!(stats.peer_closes, 1);
        assert_eq!(stats.io_errors, 0);
        assert_eq!(h.dispatcher.buffers().stats().outstanding(), 0);
        assert_eq!(h.dispatcher.exchange_pool_stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_without_execute() {
        let h = harness(Behavior::Echo, ExchangeConfig::default());
        let (server, mut client) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::native(server, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));

        client.write_all(b"not-a-length\n").await.unwrap();
        wait_closed(&conn).await;

        let stats = h.dispatcher.stats();
        assert_eq!(stats.ill_requests, 1);
        assert_eq!(stats.exchanges, 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.dispatcher.buffers().stats().outstanding(), 0);

        // Peer sees end of stream
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_body_accumulates_across_reads() {
        let h = harness(Behavior::Echo, ExchangeConfig::default());
        let body = vec![b'b'; 4096];
        let mock = tokio_test::io::Builder::new()
            .read(b"4096\n")
            .read(&body[..1000])
            .read(&body[1000..2000])
            .read(&body[2000..])
            .write(&body)
            .build();
        let conn = Arc::new(Connection::native(mock, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));
        wait_closed(&conn).await;

        assert_eq!(h.dispatcher.protocol().body_reads.load(Ordering::SeqCst), 3);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        let stats = h.dispatcher.stats();
        assert_eq!(stats.exchanges, 1);
        assert_eq!(stats.peer_closes, 1);
        assert_eq!(h.dispatcher.buffers().stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_servlet_panic_is_contained() {
        let h = harness(Behavior::Panic, ExchangeConfig::default());
        let (server, mut client) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::native(server, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));

        client.write_all(b"2\nhi").await.unwrap();
        wait_closed(&conn).await;

        let stats = h.dispatcher.stats();
        assert_eq!(stats.servlet_faults, 1);
        assert_eq!(stats.exchanges, 1);
        assert_eq!(h.dispatcher.exchange_pool_stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unfinished_response_closes_connection() {
        let h = harness(Behavior::Silent, ExchangeConfig::default());
        let (server, mut client) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::native(server, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));

        client.write_all(b"0\n").await.unwrap();
        wait_closed(&conn).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.dispatcher.stats().servlet_faults, 0);
    }

    #[tokio::test]
    async fn test_body_timeout_counts_io_error() {
        let config = ExchangeConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..ExchangeConfig::default()
        };
        let h = harness(Behavior::Echo, config);
        let (server, mut client) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::native(server, peer(), None));
        h.dispatcher.serve(Arc::clone(&conn));

        // Promise ten bytes, deliver three
        client.write_all(b"10\nabc").await.unwrap();
        wait_closed(&conn).await;

        let stats = h.dispatcher.stats();
        assert_eq!(stats.io_errors, 1);
        assert_eq!(stats.exchanges, 0);
        assert_eq!(h.dispatcher.buffers().stats().outstanding(), 0);
    }
}
