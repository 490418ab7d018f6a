//! Duplex frame transport boundary and the TCP implementation.
//!
//! The engine never sees raw sockets; it sees a sink/source pair moving whole
//! frames. On the wire each frame is prefixed with its u32 BE length.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Upper bound on a single inbound frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame length {0} exceeds limit {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
}

/// Factory for duplex frame links. One `open` call corresponds to one
/// transport connection attempt.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

/// Outbound half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Inbound half of an open link. `Ok(None)` signals orderly close.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpTransport {
    server: String,
}

impl TcpTransport {
    /// `server` is a `host:port` endpoint.
    pub fn new(server: impl Into<String>) -> Self {
        Self { server: server.into() }
    }
}

#[async_trait]
impl FrameTransport for TcpTransport {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let stream = TcpStream::connect(&self.server).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((Box::new(TcpSink { write }), Box::new(TcpSource { read })))
    }
}

struct TcpSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let len =
            u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge(frame.len()))?;
        self.write.write_all(&len.to_be_bytes()).await?;
        self.write.write_all(frame).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write.shutdown().await;
    }
}

struct TcpSource {
    read: OwnedReadHalf,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut len_bytes = [0u8; 4];
        match self.read.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.read.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_roundtrip_with_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await.expect("read len");
            let len = u32::from_be_bytes(len_bytes) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.expect("read frame");
            // Echo it back with the same framing.
            stream.write_all(&len_bytes).await.expect("write len");
            stream.write_all(&buf).await.expect("write frame");
            buf
        });

        let transport = TcpTransport::new(addr.to_string());
        let (mut sink, mut source) = transport.open().await.expect("open");
        sink.send(b"hello frame").await.expect("send");
        let echoed = source.recv().await.expect("recv").expect("frame");
        assert_eq!(echoed, b"hello frame");
        assert_eq!(server.await.expect("server"), b"hello frame");
    }

    #[tokio::test]
    async fn orderly_close_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            drop(stream);
        });

        let transport = TcpTransport::new(addr.to_string());
        let (_sink, mut source) = transport.open().await.expect("open");
        assert!(source.recv().await.expect("recv").is_none());
    }

    #[tokio::test]
    async fn oversized_inbound_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let len = (MAX_FRAME_LEN as u32) + 1;
            stream.write_all(&len.to_be_bytes()).await.expect("write len");
        });

        let transport = TcpTransport::new(addr.to_string());
        let (_sink, mut source) = transport.open().await.expect("open");
        assert!(matches!(source.recv().await, Err(TransportError::FrameTooLarge(_))));
    }
}
