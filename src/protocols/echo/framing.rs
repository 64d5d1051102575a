//! Echo framing hooks.

use super::parser::{self, Header};
use crate::runtime::exchange::{FrameStatus, Protocol, Request};
use bytes::BytesMut;
use tracing::debug;

/// Largest payload accepted by default.
pub const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024;

/// Echo protocol: `<length>\r\n<data>` frames and `QUIT`.
#[derive(Debug, Clone)]
pub struct EchoProtocol {
    max_payload: usize,
}

impl EchoProtocol {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for EchoProtocol {
    fn default() -> Self {
        Self::new(MAX_ECHO_SIZE)
    }
}

/// Parse state of one echo request.
#[derive(Debug, Default)]
pub struct EchoFrame {
    /// Payload collected so far.
    pub payload: BytesMut,
    /// Payload bytes still to be read.
    pub remaining: usize,
    pub quit: bool,
}

impl Protocol for EchoProtocol {
    type Frame = EchoFrame;

    fn read_header(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> FrameStatus {
        match parser::parse(buf, self.max_payload) {
            Header::Incomplete => FrameStatus::Incomplete,
            Header::Invalid(reason) => {
                debug!(reason, "Invalid echo header");
                FrameStatus::Malformed
            }
            Header::Quit => {
                request.frame_mut().quit = true;
                FrameStatus::Complete
            }
            Header::Echo { length, header_len } => {
                request.set_keep_alive(true);
                let available = (buf.len() - header_len).min(length);
                let frame = request.frame_mut();
                frame.payload.reserve(length);
                frame
                    .payload
                    .extend_from_slice(&buf[header_len..header_len + available]);
                frame.remaining = length - available;
                match frame.remaining {
                    0 => FrameStatus::Complete,
                    n => FrameStatus::NeedBody(n),
                }
            }
        }
    }

    fn read_body(&self, request: &mut Request<Self>, buf: &mut BytesMut) -> usize {
        let frame = request.frame_mut();
        let take = frame.remaining.min(buf.len());
        frame.payload.extend_from_slice(&buf[..take]);
        frame.remaining -= take;
        take
    }

    fn recycle(&self, frame: &mut EchoFrame) {
        // Keep the payload allocation unless it grew past one large frame.
        if frame.payload.capacity() > 64 * 1024 {
            frame.payload = BytesMut::new();
        } else {
            frame.payload.clear();
        }
        frame.remaining = 0;
        frame.quit = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::exchange::{Exchange, ExchangeStats};
    use std::sync::Arc;

    fn exchange() -> Exchange<EchoProtocol> {
        Exchange::new(
            Arc::new(BufferPool::new(1, 64)),
            Arc::new(ExchangeStats::default()),
        )
    }

    #[test]
    fn test_header_with_whole_payload() {
        let mut ex = exchange();
        let mut buf = BytesMut::from(&b"5\r\nhello"[..]);
        let status = EchoProtocol::default().read_header(&mut ex.request, &mut buf);
        assert_eq!(status, FrameStatus::Complete);
        assert!(ex.request.keep_alive());
        assert_eq!(&ex.request.frame().payload[..], b"hello");
    }

    #[test]
    fn test_header_then_body() {
        let proto = EchoProtocol::default();
        let mut ex = exchange();
        let mut buf = BytesMut::from(&b"8\r\nabc"[..]);
        assert_eq!(
            proto.read_header(&mut ex.request, &mut buf),
            FrameStatus::NeedBody(5)
        );

        let mut body = BytesMut::from(&b"defgh"[..]);
        assert_eq!(proto.read_body(&mut ex.request, &mut body), 5);
        assert_eq!(&ex.request.frame().payload[..], b"abcdefgh");
        assert_eq!(ex.request.frame().remaining, 0);

        proto.recycle(ex.request.frame_mut());
        assert!(ex.request.frame().payload.is_empty());
    }

    #[test]
    fn test_quit_and_invalid() {
        let proto = EchoProtocol::new(4);
        let mut ex = exchange();

        let mut quit = BytesMut::from(&b"QUIT\r\n"[..]);
        assert_eq!(proto.read_header(&mut ex.request, &mut quit), FrameStatus::Complete);
        assert!(ex.request.frame().quit);
        assert!(!ex.request.keep_alive());

        let mut big = BytesMut::from(&b"5\r\nhello"[..]);
        assert_eq!(proto.read_header(&mut ex.request, &mut big), FrameStatus::Malformed);

        let mut partial = BytesMut::from(&b"12"[..]);
        assert_eq!(
            proto.read_header(&mut ex.request, &mut partial),
            FrameStatus::Incomplete
        );
    }
}
