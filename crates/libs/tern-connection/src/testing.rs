//! Scriptable in-process transport for tests.
//!
//! [`MockTransport::pair`] yields a client-side [`FrameTransport`] and a
//! [`MockServer`] handle. Every successful `open` surfaces a [`MockLink`] on
//! the server side; dropping the link simulates a transport failure, and
//! queued refusals simulate unreachable servers.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tern_wire::Frame;

use crate::transport::{FrameSink, FrameSource, FrameTransport, TransportError};

struct MockShared {
    refusals: Mutex<VecDeque<()>>,
    links_tx: mpsc::UnboundedSender<MockLink>,
}

/// Client-side transport half.
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// Server-side observer and scripting handle.
pub struct MockServer {
    shared: Arc<MockShared>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockLink>>,
}

/// One open transport link, seen from the server side.
///
/// Dropping the link closes both directions; the client observes an abrupt
/// transport loss.
pub struct MockLink {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransport {
    pub fn pair() -> (Arc<MockTransport>, MockServer) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let shared =
            Arc::new(MockShared { refusals: Mutex::new(VecDeque::new()), links_tx });
        let transport = Arc::new(MockTransport { shared: Arc::clone(&shared) });
        let server = MockServer { shared, links_rx: tokio::sync::Mutex::new(links_rx) };
        (transport, server)
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let refused = self
            .shared
            .refusals
            .lock()
            .expect("refusal queue poisoned")
            .pop_front()
            .is_some();
        if refused {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused by test script",
            )));
        }

        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        let link = MockLink { rx: c2s_rx, tx: s2c_tx };
        self.shared.links_tx.send(link).map_err(|_| {
            TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "server gone"))
        })?;
        Ok((Box::new(MockSink { tx: Some(c2s_tx) }), Box::new(MockSource { rx: s2c_rx })))
    }
}

impl MockServer {
    /// Wait for the next successful `open` from the client side.
    pub async fn next_link(&self) -> MockLink {
        self.links_rx.lock().await.recv().await.expect("mock transport dropped")
    }

    /// Queue `count` connect attempts to be refused.
    pub fn refuse_next(&self, count: usize) {
        let mut refusals = self.shared.refusals.lock().expect("refusal queue poisoned");
        for _ in 0..count {
            refusals.push_back(());
        }
    }
}

impl MockLink {
    /// Next frame sent by the client, decoded.
    pub async fn recv_frame(&mut self) -> Frame {
        let bytes = self.rx.recv().await.expect("client closed the link");
        Frame::decode(&bytes).expect("client sent a malformed frame")
    }

    pub fn send_frame(&self, frame: &Frame) {
        let _ = self.tx.send(frame.encode());
    }

    /// Push raw bytes, bypassing the frame codec (malformed-input tests).
    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(bytes);
    }
}

struct MockSink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
        })?;
        tx.send(frame.to_vec()).map_err(|_| {
            TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped"))
        })
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_wire::Opcode;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, server) = MockTransport::pair();
        let (mut sink, mut source) = transport.open().await.expect("open");
        let mut link = server.next_link().await;

        sink.send(&Frame::new(Opcode::Ping, 3, Vec::new()).encode()).await.expect("send");
        let inbound = link.recv_frame().await;
        assert_eq!(inbound.opcode, Opcode::Ping);

        link.send_frame(&Frame::new(Opcode::Pong, 3, Vec::new()));
        let bytes = source.recv().await.expect("recv").expect("frame");
        assert_eq!(Frame::decode(&bytes).expect("decode").opcode, Opcode::Pong);
    }

    #[tokio::test]
    async fn refusals_fail_open() {
        let (transport, server) = MockTransport::pair();
        server.refuse_next(1);
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_ok());
    }

    #[tokio::test]
    async fn dropping_link_closes_client_source() {
        let (transport, server) = MockTransport::pair();
        let (_sink, mut source) = transport.open().await.expect("open");
        let link = server.next_link().await;
        drop(link);
        assert!(source.recv().await.expect("recv").is_none());
    }
}
