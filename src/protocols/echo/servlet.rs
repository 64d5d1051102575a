//! Echo servlet.

use super::framing::EchoProtocol;
use super::parser;
use crate::runtime::exchange::{Request, Response, Servlet, ServletError};
use async_trait::async_trait;
use tracing::trace;

/// Writes every payload back behind a fresh length header; answers `QUIT`
/// with `OK` and lets the connection close.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoServlet;

#[async_trait]
impl Servlet<EchoProtocol> for EchoServlet {
    async fn execute(
        &self,
        request: &mut Request<EchoProtocol>,
        response: &mut Response<EchoProtocol>,
    ) -> Result<(), ServletError> {
        let frame = request.frame();
        if frame.quit {
            response.finish_with_bytes(b"OK\r\n").await?;
            return Ok(());
        }
        trace!(bytes = frame.payload.len(), "Echoing payload");

        // Header and payload packed into as few pool buffers as possible
        let mut buffers = Vec::new();
        let mut current = response.poll_buffer();
        parser::put_header(frame.payload.len(), &mut current);
        let mut rest = &frame.payload[..];
        while !rest.is_empty() {
            let spare = current.capacity() - current.len();
            if spare == 0 && !current.is_empty() {
                buffers.push(std::mem::replace(&mut current, response.poll_buffer()));
                continue;
            }
            let n = spare.max(1).min(rest.len());
            current.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        buffers.push(current);

        response.finish_with_buffers(buffers).await?;
        Ok(())
    }
}
