//! Peer-facing connections.
//!
//! One `Connection` type covers three transport variants:
//! - `NativeStream`: any tokio `AsyncRead + AsyncWrite` stream (TCP sockets,
//!   in-memory duplex pipes), driven by the runtime's I/O driver
//! - `BlockingStream`: a std `TcpStream` whose blocking calls run on the
//!   runtime's blocking pool and are reported as futures
//! - `Datagram`: a UDP socket bound to one peer address for its lifetime
//!
//! All variants share the same contract: reads and writes take their buffers
//! by value and always hand them back, each direction has its own timeout,
//! and close is idempotent and safe to call while an operation is in flight.
//! Variant dispatch happens only in the I/O primitives below.
//!
//! At most one read and one write may be outstanding on a connection.

use crate::runtime::buffer::BufferChain;
use bytes::BytesMut;
use socket2::{SockAddr, SockRef};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Result of an owned-buffer I/O operation: the outcome plus the buffer,
/// which is returned on success and failure alike.
pub type BufResult<T, B> = (io::Result<T>, B);

/// Streams usable by the native variant.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxStream = Box<dyn AsyncStream>;

/// How often a blocked datagram read wakes up to observe close.
const DATAGRAM_POLL: Duration = Duration::from_millis(50);
type Attribute = Arc<dyn Any + Send + Sync>;

/// Transport variant of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Native asynchronous byte stream.
    NativeStream,
    /// Blocking TCP socket adapted to the async contract.
    BlockingStream,
    /// Connectionless datagram socket with a fixed peer.
    Datagram,
}

impl ConnectionKind {
    /// Whether the variant is a byte stream (as opposed to datagrams).
    pub fn is_stream(self) -> bool {
        !matches!(self, ConnectionKind::Datagram)
    }
}

/// Convert a timeout in seconds into the connection form; `<= 0` means none.
pub fn timeout_from_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

enum Channel {
    Native {
        reader: AsyncMutex<Option<ReadHalf<BoxStream>>>,
        writer: AsyncMutex<Option<WriteHalf<BoxStream>>>,
    },
    Blocking {
        stream: Arc<StdTcpStream>,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        /// False for a listener's pseudo-connection, which shares the
        /// listening socket with every other peer.
        owned: bool,
    },
}

/// A single peer-facing channel.
pub struct Connection {
    channel: Channel,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    /// Milliseconds, 0 = no timeout.
    read_timeout: AtomicU64,
    write_timeout: AtomicU64,
    /// Shared with blocking datagram reads, which poll it.
    closed: Arc<AtomicBool>,
    closing: Notify,
    attachment: Mutex<Option<Attribute>>,
    attributes: Mutex<HashMap<String, Attribute>>,
}

impl Connection {
    fn with_channel(
        channel: Channel,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            channel,
            remote_addr,
            local_addr,
            read_timeout: AtomicU64::new(0),
            write_timeout: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            closing: Notify::new(),
            attachment: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap a native asynchronous stream.
    pub fn native<S>(stream: S, remote_addr: SocketAddr, local_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncStream + 'static,
    {
        let (reader, writer) = tokio::io::split(Box::new(stream) as BoxStream);
        Self::with_channel(
            Channel::Native {
                reader: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(writer)),
            },
            remote_addr,
            local_addr,
        )
    }

    /// Wrap a connected tokio TCP stream as a native connection.
    pub fn from_tcp(stream: tokio::net::TcpStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();
        Ok(Self::native(stream, remote_addr, local_addr))
    }

    /// Wrap a connected std TCP stream in the blocking adapter.
    pub fn blocking(stream: StdTcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();
        Ok(Self::with_channel(
            Channel::Blocking {
                stream: Arc::new(stream),
            },
            remote_addr,
            local_addr,
        ))
    }

    /// Create a datagram connection fixed to `remote_addr`.
    ///
    /// `owned` sockets belong to this connection alone; a non-owned socket is
    /// a listener's shared socket and is never read from here.
    pub fn datagram(socket: Arc<UdpSocket>, remote_addr: SocketAddr, owned: bool) -> Self {
        let local_addr = socket.local_addr().ok();
        Self::with_channel(Channel::Datagram { socket, owned }, remote_addr, local_addr)
    }

    /// Transport variant.
    pub fn kind(&self) -> ConnectionKind {
        match self.channel {
            Channel::Native { .. } => ConnectionKind::NativeStream,
            Channel::Blocking { .. } => ConnectionKind::BlockingStream,
            Channel::Datagram { .. } => ConnectionKind::Datagram,
        }
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address, when the variant knows it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        load_timeout(&self.read_timeout)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        load_timeout(&self.write_timeout)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        store_timeout(&self.read_timeout, timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        store_timeout(&self.write_timeout, timeout);
    }

    /// Read into the spare capacity of `buf`, appending after its current
    /// contents. `Ok(0)` means end of stream.
    pub async fn read(&self, buf: BytesMut) -> BufResult<usize, BytesMut> {
        if self.is_closed() {
            return (Err(closed_error()), buf);
        }
        if buf.len() == buf.capacity() {
            return (
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read buffer has no spare capacity",
                )),
                buf,
            );
        }

        match &self.channel {
            Channel::Native { reader, .. } => self.read_native(reader, buf).await,
            Channel::Blocking { stream } => {
                let stream = Arc::clone(stream);
                let timeout = self.read_timeout();
                let task = tokio::task::spawn_blocking(move || {
                    fill_with(buf, |dst| {
                        stream.set_read_timeout(timeout)?;
                        (&*stream).read(dst)
                    })
                });
                self.join_blocking(task).await
            }
            Channel::Datagram { socket, owned } => {
                if !owned {
                    return (
                        Err(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "shared datagram socket is read by its listener",
                        )),
                        buf,
                    );
                }
                let socket = Arc::clone(socket);
                let closed = Arc::clone(&self.closed);
                let remote = self.remote_addr;
                let timeout = self.read_timeout();
                let task = tokio::task::spawn_blocking(move || {
                    fill_with(buf, |dst| recv_from_peer(&socket, remote, timeout, &closed, dst))
                });
                self.join_blocking(task).await
            }
        }
    }

    /// Issue one scatter/gather write of the chain's unwritten bytes.
    ///
    /// May write fewer bytes than requested; the chain is returned untouched
    /// so the caller can advance it and write the rest.
    pub async fn write(&self, chain: BufferChain) -> BufResult<usize, BufferChain> {
        if self.is_closed() {
            return (Err(closed_error()), chain);
        }
        if chain.is_empty() {
            return (Ok(0), chain);
        }

        match &self.channel {
            Channel::Native { writer, .. } => self.write_native(writer, chain).await,
            Channel::Blocking { stream } => {
                let stream = Arc::clone(stream);
                let timeout = self.write_timeout();
                let task = tokio::task::spawn_blocking(move || {
                    let result = stream
                        .set_write_timeout(timeout)
                        .and_then(|()| (&*stream).write_vectored(&chain.io_slices()));
                    (result.map_err(blocking_error), chain)
                });
                self.join_blocking(task).await
            }
            Channel::Datagram { socket, owned } => {
                let socket = Arc::clone(socket);
                let owned = *owned;
                let remote = self.remote_addr;
                let timeout = self.write_timeout();
                let task = tokio::task::spawn_blocking(move || {
                    let result = send_datagram(&socket, owned, timeout, remote, &chain);
                    (result.map_err(blocking_error), chain)
                });
                self.join_blocking(task).await
            }
        }
    }

    /// Write the whole chain, re-issuing writes until every buffer is drained.
    ///
    /// Each buffer is passed to `drained` exactly once: as soon as it has been
    /// fully written, or on failure along with the rest of the chain.
    pub async fn write_all(
        &self,
        mut chain: BufferChain,
        mut drained: impl FnMut(BytesMut),
    ) -> io::Result<()> {
        while !chain.is_empty() {
            let (result, returned) = self.write(chain).await;
            chain = returned;
            match result {
                Ok(0) => {
                    chain.release(&mut drained);
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection accepted no bytes",
                    ));
                }
                Ok(n) => chain.advance(n, &mut drained),
                Err(e) => {
                    chain.release(&mut drained);
                    return Err(e);
                }
            }
        }
        chain.release(drained);
        Ok(())
    }

    /// Close the connection and release everything attached to it.
    ///
    /// Idempotent. In-flight operations complete with `NotConnected`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.notify_waiters();

        // Dropping attached values releases the resources they own.
        let attachment = lock(&self.attachment).take();
        let attributes = std::mem::take(&mut *lock(&self.attributes));
        drop(attachment);
        drop(attributes);

        let result = match &self.channel {
            Channel::Native { reader, writer } => {
                // A half held by an in-flight operation is dropped by that
                // operation once it observes the close.
                if let Ok(mut half) = reader.try_lock() {
                    half.take();
                }
                if let Ok(mut half) = writer.try_lock() {
                    half.take();
                }
                Ok(())
            }
            Channel::Blocking { stream } => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            // Owned sockets close when the last operation lets go of them;
            // a pending read notices the flag within one poll interval.
            // Shared sockets belong to the listener.
            Channel::Datagram { .. } => Ok(()),
        };

        debug!(peer = %self.remote_addr, kind = ?self.kind(), "Connection closed");
        result
    }

    /// Close, logging instead of returning errors.
    pub fn dispose(&self) {
        if let Err(e) = self.close() {
            debug!(peer = %self.remote_addr, error = %e, "Error closing connection");
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let notified = self.closing.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Attach the single extension object, returning the previous one.
    ///
    /// On a closed connection the value is dropped immediately.
    pub fn attach<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut slot = lock(&self.attachment);
        if self.is_closed() {
            return None;
        }
        slot.replace(Arc::new(value))
    }

    /// The extension object, if present and of type `T`.
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        lock(&self.attachment).clone()?.downcast::<T>().ok()
    }

    /// Store a named protocol attribute.
    pub fn set_attribute<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        let mut attributes = lock(&self.attributes);
        if self.is_closed() {
            return;
        }
        attributes.insert(name.into(), Arc::new(value));
    }

    /// A named attribute, if present and of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        lock(&self.attributes).get(name).cloned()?.downcast::<T>().ok()
    }

    /// Remove a named attribute. Returns whether it was present.
    pub fn remove_attribute(&self, name: &str) -> bool {
        lock(&self.attributes).remove(name).is_some()
    }

    async fn read_native(
        &self,
        reader: &AsyncMutex<Option<ReadHalf<BoxStream>>>,
        mut buf: BytesMut,
    ) -> BufResult<usize, BytesMut> {
        let mut guard = reader.lock().await;
        let Some(half) = guard.as_mut() else {
            return (Err(closed_error()), buf);
        };

        let start = buf.len();
        buf.resize(buf.capacity(), 0);
        let result = self
            .guard_io(self.read_timeout(), "read", half.read(&mut buf[start..]))
            .await;
        let result = self.settle(result);
        if self.is_closed() {
            guard.take();
        }

        buf.truncate(start + result.as_ref().map_or(0, |n| *n));
        (result, buf)
    }

    async fn write_native(
        &self,
        writer: &AsyncMutex<Option<WriteHalf<BoxStream>>>,
        chain: BufferChain,
    ) -> BufResult<usize, BufferChain> {
        let mut guard = writer.lock().await;
        let Some(half) = guard.as_mut() else {
            return (Err(closed_error()), chain);
        };

        let result = {
            let slices = chain.io_slices();
            self.guard_io(self.write_timeout(), "write", async {
                let n = half.write_vectored(&slices).await?;
                half.flush().await?;
                Ok::<_, io::Error>(n)
            })
            .await
        };
        let result = self.settle(result);
        if self.is_closed() {
            guard.take();
        }
        (result, chain)
    }

    /// Run a native operation under the direction's timeout, aborting it if
    /// the connection is closed meanwhile.
    async fn guard_io<T>(
        &self,
        timeout: Option<Duration>,
        op: &'static str,
        operation: impl Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.is_closed() {
            return Err(closed_error());
        }

        let timed = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, operation).await {
                    Ok(result) => result,
                    Err(_) => Err(timed_out(op, limit)),
                },
                None => operation.await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut closing => Err(closed_error()),
            result = timed => result,
        }
    }

    async fn join_blocking<T, B: Default>(
        &self,
        task: JoinHandle<BufResult<T, B>>,
    ) -> BufResult<T, B> {
        match task.await {
            Ok((result, buf)) => (self.settle(result), buf),
            Err(e) => (Err(io::Error::other(e)), B::default()),
        }
    }

    /// A completion that races with close is reported as a failure.
    fn settle<T>(&self, result: io::Result<T>) -> io::Result<T> {
        match result {
            Ok(_) if self.is_closed() => Err(closed_error()),
            other => other,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind())
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read into the spare capacity of `buf` with a blocking reader.
fn fill_with(
    mut buf: BytesMut,
    read: impl FnOnce(&mut [u8]) -> io::Result<usize>,
) -> BufResult<usize, BytesMut> {
    let start = buf.len();
    buf.resize(buf.capacity(), 0);
    let result = read(&mut buf[start..]).map_err(blocking_error);
    buf.truncate(start + result.as_ref().map_or(0, |n| *n));
    (result, buf)
}

/// Receive the next datagram sent by `remote`.
///
/// Blocks in slices of `DATAGRAM_POLL` so a close is observed while waiting.
fn recv_from_peer(
    socket: &UdpSocket,
    remote: SocketAddr,
    timeout: Option<Duration>,
    closed: &AtomicBool,
    dst: &mut [u8],
) -> io::Result<usize> {
    let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
    loop {
        if closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let wait = match deadline {
            Some((at, limit)) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(timed_out("read", limit));
                }
                left.min(DATAGRAM_POLL)
            }
            None => DATAGRAM_POLL,
        };
        socket.set_read_timeout(Some(wait))?;
        match socket.recv_from(dst) {
            Ok((n, from)) if from == remote => return Ok(n),
            Ok((_, from)) => {
                trace!(peer = %from, expected = %remote, "Dropping stray datagram");
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

fn send_datagram(
    socket: &UdpSocket,
    owned: bool,
    timeout: Option<Duration>,
    remote: SocketAddr,
    chain: &BufferChain,
) -> io::Result<usize> {
    if owned {
        socket.set_write_timeout(timeout)?;
    }
    SockRef::from(socket).send_to_vectored(&chain.io_slices(), &SockAddr::from(remote))
}

fn load_timeout(millis: &AtomicU64) -> Option<Duration> {
    match millis.load(Ordering::Relaxed) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

fn store_timeout(millis: &AtomicU64, timeout: Option<Duration>) {
    let ms = timeout.map_or(0, |d| d.as_millis().clamp(1, u64::MAX as u128) as u64);
    millis.store(ms, Ordering::Relaxed);
}

/// Socket timeouts on blocking calls surface as `WouldBlock` on Unix.
fn blocking_error(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        e
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

fn timed_out(op: &'static str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{op} timed out after {limit:?}"),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
