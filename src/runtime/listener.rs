//! Server-side accept and receive loops.
//!
//! A `Listener` owns one bound socket and turns every new peer into a
//! [`Connection`] handed to a [`Dispatch`] implementation:
//!
//! - Stream listeners run an accept loop as a task on the worker runtime.
//!   Acceptance is re-armed right after each connection is handed off, and a
//!   failed accept is logged and retried rather than ending the loop.
//! - Datagram listeners run a dedicated receive thread. Each datagram is
//!   read into a pooled buffer and dispatched as a complete frame on a
//!   pseudo-connection bound to the sender's address.
//!
//! Closing the listener stops the loop. Exchanges already dispatched are
//! left to finish on their own.

use crate::error::Error;
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{Connection, ConnectionKind};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// How often the datagram receive loop checks for shutdown while idle.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Receiver of newly accepted peers.
pub trait Dispatch: Send + Sync + 'static {
    /// A new stream connection was accepted.
    fn on_stream(self: Arc<Self>, connection: Arc<Connection>);

    /// A datagram arrived from `connection`'s peer.
    fn on_datagram(self: Arc<Self>, connection: Arc<Connection>, datagram: BytesMut);
}

#[derive(Default)]
struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// A bound server socket and its accept/receive loop.
pub struct Listener {
    kind: ConnectionKind,
    buffers: Arc<BufferPool>,
    handle: Handle,
    /// Bound but not yet accepting.
    socket: Mutex<Option<Socket>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Shutdown>,
}

impl Listener {
    /// Create a listener for `kind` connections.
    ///
    /// Accepted streams are served on `handle`; datagram buffers come from
    /// `buffers`.
    pub fn open(kind: ConnectionKind, buffers: Arc<BufferPool>, handle: Handle) -> Self {
        Self {
            kind,
            buffers,
            handle,
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Bind to `addr`, returning the actual local address.
    ///
    /// `backlog` only applies to stream listeners.
    pub fn bind(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr, Error> {
        if self.shutdown.is_requested() {
            return Err(Error::InvalidState("listener is closed"));
        }
        let mut local = lock(&self.local_addr);
        if local.is_some() {
            return Err(Error::InvalidState("listener is already bound"));
        }

        let domain = Domain::for_address(addr);
        let socket = if self.kind.is_stream() {
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
        } else {
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?
        };
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        if self.kind.is_stream() {
            socket.listen(backlog.min(i32::MAX as u32) as i32)?;
        }

        let bound = socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::InvalidState("bound address is not an IP address"))?;
        *lock(&self.socket) = Some(socket);
        *local = Some(bound);
        info!(address = %bound, kind = ?self.kind, "Listener bound");
        Ok(bound)
    }

    /// Local address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Start the accept (or receive) loop, handing every peer to `dispatch`.
    pub fn accept(&self, dispatch: Arc<dyn Dispatch>) -> Result<(), Error> {
        if self.shutdown.is_requested() {
            return Err(Error::InvalidState("listener is closed"));
        }
        let socket = lock(&self.socket)
            .take()
            .ok_or(Error::InvalidState("listener is not bound or already accepting"))?;

        if self.kind.is_stream() {
            socket.set_nonblocking(true)?;
            let listener = {
                let _guard = self.handle.enter();
                tokio::net::TcpListener::from_std(socket.into())?
            };
            self.handle.spawn(accept_streams(
                listener,
                self.kind,
                dispatch,
                Arc::clone(&self.shutdown),
            ));
        } else {
            let socket: UdpSocket = socket.into();
            socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
            let socket = Arc::new(socket);
            let buffers = Arc::clone(&self.buffers);
            let shutdown = Arc::clone(&self.shutdown);
            let name = match self.local_addr() {
                Some(addr) => format!("udp-recv-{}", addr.port()),
                None => "udp-recv".to_string(),
            };
            thread::Builder::new()
                .name(name)
                .spawn(move || receive_datagrams(socket, buffers, dispatch, shutdown))?;
        }
        Ok(())
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Idempotent. The socket is released by the loop itself, as soon as it
    /// observes the shutdown.
    pub fn close(&self) {
        if self.shutdown.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify.notify_waiters();
        lock(&self.socket).take();
        debug!(address = ?self.local_addr(), "Listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_requested()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn accept_streams(
    listener: tokio::net::TcpListener,
    kind: ConnectionKind,
    dispatch: Arc<dyn Dispatch>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => match wrap_stream(stream, kind) {
                Ok(connection) => {
                    trace!(peer = %peer, "Accepted connection");
                    Arc::clone(&dispatch).on_stream(Arc::new(connection));
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to set up accepted connection");
                }
            },
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
    debug!("Accept loop stopped");
}

fn wrap_stream(stream: tokio::net::TcpStream, kind: ConnectionKind) -> io::Result<Connection> {
    stream.set_nodelay(true)?;
    match kind {
        ConnectionKind::NativeStream => Connection::from_tcp(stream),
        _ => Connection::blocking(stream.into_std()?),
    }
}

fn receive_datagrams(
    socket: Arc<UdpSocket>,
    buffers: Arc<BufferPool>,
    dispatch: Arc<dyn Dispatch>,
    shutdown: Arc<Shutdown>,
) {
    while !shutdown.is_requested() {
        let mut buf = buffers.get();
        buf.resize(buf.capacity(), 0);
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                trace!(peer = %peer, bytes = n, "Received datagram");
                let connection = Connection::datagram(Arc::clone(&socket), peer, false);
                Arc::clone(&dispatch).on_datagram(Arc::new(connection), buf);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                buffers.offer(buf);
            }
            Err(e) => {
                buffers.offer(buf);
                if !shutdown.is_requested() {
                    warn!(error = %e, "Datagram receive failed");
                }
            }
        }
    }
    debug!("Receive loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferChain;
    use tokio::sync::mpsc;

    type Accepted = (Arc<Connection>, Option<BytesMut>);

    struct Collect(mpsc::UnboundedSender<Accepted>);

    impl Dispatch for Collect {
        fn on_stream(self: Arc<Self>, connection: Arc<Connection>) {
            let _ = self.0.send((connection, None));
        }

        fn on_datagram(self: Arc<Self>, connection: Arc<Connection>, datagram: BytesMut) {
            let _ = self.0.send((connection, Some(datagram)));
        }
    }

    fn listener(kind: ConnectionKind) -> (Listener, mpsc::UnboundedReceiver<Accepted>) {
        let buffers = Arc::new(BufferPool::new(8, 512));
        let listener = Listener::open(kind, buffers, Handle::current());
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = listener.bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        assert_eq!(listener.local_addr(), Some(addr));
        listener.accept(Arc::new(Collect(tx))).unwrap();
        (listener, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("nothing dispatched")
            .expect("dispatch channel closed")
    }

    #[tokio::test]
    async fn test_accepts_native_streams() {
        let (listener, mut rx) = listener(ConnectionKind::NativeStream);
        let addr = listener.local_addr().unwrap();

        let first = tokio::net::TcpStream::connect(addr).await.unwrap();
        let second = tokio::net::TcpStream::connect(addr).await.unwrap();

        let (conn, datagram) = next(&mut rx).await;
        assert!(datagram.is_none());
        assert_eq!(conn.kind(), ConnectionKind::NativeStream);
        assert_eq!(conn.local_addr(), Some(addr));
        let (other, _) = next(&mut rx).await;

        let mut peers = vec![conn.remote_addr(), other.remote_addr()];
        peers.sort();
        let mut expected = vec![first.local_addr().unwrap(), second.local_addr().unwrap()];
        expected.sort();
        assert_eq!(peers, expected);

        listener.close();
        assert!(listener.is_closed());
        assert!(matches!(
            listener.accept(Arc::new(Collect(mpsc::unbounded_channel().0))),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accepts_blocking_streams() {
        let (listener, mut rx) = listener(ConnectionKind::BlockingStream);
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (conn, _) = next(&mut rx).await;
        assert_eq!(conn.kind(), ConnectionKind::BlockingStream);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc").await.unwrap();
        let (result, buf) = conn.read(BytesMut::with_capacity(16)).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(&buf[..], b"abc");
        listener.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receives_datagrams_on_pseudo_connections() {
        let (listener, mut rx) = listener(ConnectionKind::Datagram);
        let addr = listener.local_addr().unwrap();

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"frame", addr).await.unwrap();

        let (conn, datagram) = next(&mut rx).await;
        assert_eq!(conn.kind(), ConnectionKind::Datagram);
        assert_eq!(conn.remote_addr(), client.local_addr().unwrap());
        assert_eq!(&datagram.unwrap()[..], b"frame");

        // Replies go to the fixed peer from the shared socket
        let reply = BufferChain::from(BytesMut::from(&b"ack"[..]));
        conn.write_all(reply, drop).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack");
        assert_eq!(from, addr);

        listener.close();
    }

    #[tokio::test]
    async fn test_bind_and_accept_state_errors() {
        let buffers = Arc::new(BufferPool::new(1, 64));
        let listener = Listener::open(ConnectionKind::NativeStream, buffers, Handle::current());
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatch: Arc<dyn Dispatch> = Arc::new(Collect(tx));

        assert!(matches!(
            listener.accept(Arc::clone(&dispatch)),
            Err(Error::InvalidState(_))
        ));
        listener.bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert!(matches!(
            listener.bind("127.0.0.1:0".parse().unwrap(), 16),
            Err(Error::InvalidState(_))
        ));

        // Binding an address in use is reported to the caller
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let other = Listener::open(
            ConnectionKind::NativeStream,
            Arc::new(BufferPool::new(1, 64)),
            Handle::current(),
        );
        assert!(matches!(
            other.bind(taken.local_addr().unwrap(), 16),
            Err(Error::Io(_))
        ));
    }
}
