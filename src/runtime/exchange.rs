//! Request/response exchange types.
//!
//! An exchange is one request/response cycle on a connection. The pair is
//! drawn from a pool, bound to a connection by `init`, filled in by the
//! protocol's framing hooks, handed to a servlet, and unbound by `recycle`.
//!
//! Wire formats plug in through the [`Protocol`] trait; business logic plugs
//! in through [`Servlet`]. The dispatcher drives the state machine between
//! them.

use crate::error::Error;
use crate::runtime::buffer::{BufferChain, BufferPool};
use crate::runtime::connection::Connection;
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

type Value = Box<dyn Any + Send + Sync>;

/// Outcome of parsing a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Header and the whole body are present; execute now.
    Complete,
    /// This many more body bytes must be read before executing.
    NeedBody(usize),
    /// The input is not a valid frame.
    Malformed,
    /// The peer stopped in the middle of a frame.
    Incomplete,
}

/// Wire-format hooks invoked by the dispatcher.
pub trait Protocol: Sized + Send + Sync + 'static {
    /// Per-exchange parse state, reset between exchanges.
    type Frame: Default + Send + Sync + 'static;

    /// Parse a header from the bytes read so far.
    ///
    /// Any body bytes already present should be consumed here. Setting
    /// keep-alive on the request is this hook's responsibility.
    fn read_header(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> FrameStatus;

    /// Consume body bytes from `buf`, returning how many were consumed.
    fn read_body(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> usize;

    /// Finalize the request before it is handed to the servlet.
    fn prepare(&self, _request: &mut Request<Self>) {}

    /// Reset frame state for the next exchange.
    fn recycle(&self, frame: &mut Self::Frame) {
        *frame = Self::Frame::default();
    }
}

/// Errors a servlet may return.
pub type ServletError = Box<dyn std::error::Error + Send + Sync>;

/// Application logic executed once per exchange.
///
/// The servlet should finish the response. If it returns without doing so,
/// the connection is closed.
#[async_trait]
pub trait Servlet<P: Protocol>: Send + Sync + 'static {
    async fn execute(
        &self,
        request: &mut Request<P>,
        response: &mut Response<P>,
    ) -> Result<(), ServletError>;
}

/// The request half of an exchange.
pub struct Request<P: Protocol> {
    connection: Option<Arc<Connection>>,
    created_at: DateTime<Utc>,
    keep_alive: bool,
    frame: P::Frame,
    /// Survives recycling; bound once per pooled instance.
    properties: HashMap<String, Value>,
    /// Cleared on every recycle.
    attributes: HashMap<String, Value>,
}

impl<P: Protocol> Request<P> {
    fn new() -> Self {
        Self {
            connection: None,
            created_at: Utc::now(),
            keep_alive: false,
            frame: P::Frame::default(),
            properties: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// Connection this request arrived on, while the exchange is active.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// When the current exchange started.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Forbid reusing the connection after this exchange.
    pub fn refuse_alive(&mut self) {
        self.keep_alive = false;
    }

    pub fn frame(&self) -> &P::Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut P::Frame {
        &mut self.frame
    }

    pub fn property<T: Any>(&self, name: &str) -> Option<&T> {
        self.properties.get(name)?.downcast_ref()
    }

    pub fn set_property<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.properties.insert(name.into(), Box::new(value));
    }

    pub fn attribute<T: Any>(&self, name: &str) -> Option<&T> {
        self.attributes.get(name)?.downcast_ref()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.attributes.insert(name.into(), Box::new(value));
    }

    pub fn remove_attribute(&mut self, name: &str) -> bool {
        self.attributes.remove(name).is_some()
    }
}

impl<P: Protocol> fmt::Debug for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("connection", &self.connection)
            .field("created_at", &self.created_at)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Idle,
    Active,
    Finished { kill: bool },
}

type RecycleListener<P> = Box<dyn FnOnce(&Request<P>, &Response<P>) + Send>;

/// The response half of an exchange.
///
/// Finish methods only fail on misuse (finishing an inactive exchange). A
/// write failure is recovered here: the buffers go back to the pool, the
/// error is counted and the response is finished with kill.
pub struct Response<P: Protocol> {
    connection: Option<Arc<Connection>>,
    buffers: Arc<BufferPool>,
    stats: Arc<ExchangeStats>,
    state: ResponseState,
    recycle_listener: Option<RecycleListener<P>>,
}

impl<P: Protocol> Response<P> {
    fn new(buffers: Arc<BufferPool>, stats: Arc<ExchangeStats>) -> Self {
        Self {
            connection: None,
            buffers,
            stats,
            state: ResponseState::Idle,
            recycle_listener: None,
        }
    }

    /// Connection the response is written to, while the exchange is active.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// `Some(kill)` once finished, `None` before.
    pub fn finished(&self) -> Option<bool> {
        match self.state {
            ResponseState::Finished { kill } => Some(kill),
            _ => None,
        }
    }

    /// Borrow a buffer from the pool for composing the response.
    pub fn poll_buffer(&self) -> BytesMut {
        self.buffers.get()
    }

    /// Give back a buffer that will not be written.
    pub fn offer_buffer(&self, buf: BytesMut) {
        self.buffers.offer(buf);
    }

    /// Run `listener` once, just before the exchange is recycled.
    pub fn set_recycle_listener(
        &mut self,
        listener: impl FnOnce(&Request<P>, &Response<P>) + Send + 'static,
    ) {
        self.recycle_listener = Some(Box::new(listener));
    }

    /// Finish without a payload. `kill` closes the connection afterwards.
    pub fn finish(&mut self, kill: bool) -> Result<(), Error> {
        self.ensure_active()?;
        self.complete(kill);
        Ok(())
    }

    /// Write one buffer and finish.
    pub async fn finish_with(&mut self, buf: BytesMut) -> Result<(), Error> {
        self.finish_with_buffers(vec![buf]).await
    }

    /// Copy `payload` into pooled buffers, write them and finish.
    pub async fn finish_with_bytes(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.ensure_active()?;
        let size = self.buffers.buffer_size().max(1);
        let buffers = payload
            .chunks(size)
            .map(|chunk| {
                let mut buf = self.buffers.get();
                buf.extend_from_slice(chunk);
                buf
            })
            .collect();
        self.finish_with_buffers(buffers).await
    }

    /// Write `buffers` as one logical payload and finish.
    ///
    /// Every buffer is returned to the pool, whether the write succeeds or
    /// not.
    pub async fn finish_with_buffers(&mut self, buffers: Vec<BytesMut>) -> Result<(), Error> {
        if let Err(e) = self.ensure_active() {
            buffers.into_iter().for_each(|b| self.buffers.offer(b));
            return Err(e);
        }
        let Some(conn) = self.connection.clone() else {
            buffers.into_iter().for_each(|b| self.buffers.offer(b));
            return Err(Error::InactiveExchange);
        };

        let pool = Arc::clone(&self.buffers);
        match conn.write_all(BufferChain::from(buffers), |b| pool.offer(b)).await {
            Ok(()) => self.complete(false),
            Err(e) => {
                self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %conn.remote_addr(), error = %e, "Response write failed");
                self.complete(true);
            }
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match self.state {
            ResponseState::Idle => Err(Error::InactiveExchange),
            ResponseState::Finished { kill: true } => {
                Err(Error::InvalidState("response already finished with kill"))
            }
            _ => Ok(()),
        }
    }

    /// Kill is sticky across repeated finishes.
    fn complete(&mut self, kill: bool) {
        let kill = kill || self.finished() == Some(true);
        self.state = ResponseState::Finished { kill };
    }
}

impl<P: Protocol> fmt::Debug for Response<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A pooled request/response pair.
#[derive(Debug)]
pub struct Exchange<P: Protocol> {
    pub request: Request<P>,
    pub response: Response<P>,
}

impl<P: Protocol> Exchange<P> {
    pub fn new(buffers: Arc<BufferPool>, stats: Arc<ExchangeStats>) -> Self {
        Self {
            request: Request::new(),
            response: Response::new(buffers, stats),
        }
    }

    /// Bind both halves to `connection` and start a new exchange.
    pub fn init(&mut self, connection: Arc<Connection>) {
        self.request.created_at = Utc::now();
        self.request.keep_alive = false;
        self.request.connection = Some(Arc::clone(&connection));
        self.response.connection = Some(connection);
        self.response.state = ResponseState::Active;
    }

    /// Whether `init` has been called since the last `recycle`.
    pub fn is_active(&self) -> bool {
        self.response.state != ResponseState::Idle
    }

    /// End the exchange: run the recycle listener, drop per-exchange state
    /// and unbind both halves from the connection.
    pub fn recycle(&mut self, protocol: &P) {
        if let Some(listener) = self.response.recycle_listener.take() {
            listener(&self.request, &self.response);
        }
        self.request.attributes.clear();
        self.request.keep_alive = false;
        self.request.connection = None;
        self.response.connection = None;
        self.response.state = ResponseState::Idle;
        protocol.recycle(&mut self.request.frame);
    }
}

/// Counters shared by every exchange of a dispatcher.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    pub(crate) exchanges: AtomicU64,
    pub(crate) ill_requests: AtomicU64,
    pub(crate) io_errors: AtomicU64,
    pub(crate) servlet_faults: AtomicU64,
    pub(crate) peer_closes: AtomicU64,
}

/// Point-in-time copy of [`ExchangeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeSnapshot {
    /// Servlet executions.
    pub exchanges: u64,
    /// Malformed frames.
    pub ill_requests: u64,
    /// Read/write failures and timeouts.
    pub io_errors: u64,
    /// Servlets that returned an error or panicked.
    pub servlet_faults: u64,
    /// Connections closed by the peer between exchanges.
    pub peer_closes: u64,
}

impl ExchangeStats {
    pub fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            exchanges: self.exchanges.load(Ordering::Relaxed),
            ill_requests: self.ill_requests.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            servlet_faults: self.servlet_faults.load(Ordering::Relaxed),
            peer_closes: self.peer_closes.load(Ordering::Relaxed),
        }
    }
}
