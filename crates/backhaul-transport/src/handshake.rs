//! `Open`/`Accepted` stream establishment over TCP

use crate::framed::FramedStream;
use crate::{BoxFrameSink, BoxFrameSource, TransportError, TransportResult};
use backhaul_proto::{Frame, Metadata};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// How long either side waits for the peer's handshake frame
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream whose handshake completed
#[derive(Debug)]
pub struct Established {
    pub sink: BoxFrameSink,
    pub source: BoxFrameSource,
    /// Metadata sent by the peer
    pub metadata: Metadata,
    pub peer_addr: SocketAddr,
}

/// Open a TCP stream to `addr` and exchange `Open`/`Accepted`
pub async fn connect_with_metadata(
    addr: &str,
    metadata: Metadata,
) -> TransportResult<Established> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;

    let mut framed = FramedStream::new(stream);
    framed.send_frame(Frame::Open { metadata }).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.recv_frame())
        .await
        .map_err(|_| TransportError::Timeout)??;

    match reply {
        Some(Frame::Accepted { metadata }) => {
            debug!(peer = %peer_addr, "Stream accepted");
            let (sink, source) = framed.split();
            Ok(Established {
                sink: Box::new(sink),
                source: Box::new(source),
                metadata,
                peer_addr,
            })
        }
        Some(Frame::Rejected { reason }) => Err(TransportError::Rejected(reason)),
        Some(other) => Err(TransportError::ProtocolError(format!(
            "expected Accepted, got {:?}",
            other
        ))),
        None => Err(TransportError::StreamClosed),
    }
}

/// An inbound stream that sent `Open` and awaits a decision
#[derive(Debug)]
pub struct PendingHandshake {
    framed: FramedStream<TcpStream>,
    metadata: Metadata,
    peer_addr: SocketAddr,
}

impl PendingHandshake {
    /// Metadata the initiator sent with `Open`
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reply `Accepted` with our own metadata and hand out the split stream
    pub async fn accept(mut self, metadata: Metadata) -> TransportResult<Established> {
        self.framed.send_frame(Frame::Accepted { metadata }).await?;
        let (sink, source) = self.framed.split();
        Ok(Established {
            sink: Box::new(sink),
            source: Box::new(source),
            metadata: self.metadata,
            peer_addr: self.peer_addr,
        })
    }

    /// Reply `Rejected` and drop the stream
    pub async fn reject(mut self, reason: impl Into<String>) -> TransportResult<()> {
        self.framed
            .send_frame(Frame::Rejected {
                reason: reason.into(),
            })
            .await
    }
}

/// Read the initiator's `Open` frame from a freshly accepted TCP stream
pub async fn accept_handshake(
    stream: TcpStream,
    timeout: Duration,
) -> TransportResult<PendingHandshake> {
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;
    let mut framed = FramedStream::new(stream);

    let first = tokio::time::timeout(timeout, framed.recv_frame())
        .await
        .map_err(|_| TransportError::Timeout)??;

    match first {
        Some(Frame::Open { metadata }) => Ok(PendingHandshake {
            framed,
            metadata,
            peer_addr,
        }),
        Some(other) => Err(TransportError::ProtocolError(format!(
            "expected Open, got {:?}",
            other
        ))),
        None => Err(TransportError::StreamClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::metadata::{AGENT_ID, SERVER_ID};
    use backhaul_proto::Packet;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let pending = accept_handshake(stream, HANDSHAKE_TIMEOUT).await.unwrap();
            assert_eq!(pending.metadata().get(AGENT_ID), Some("agent-1"));

            let mut established = pending
                .accept(Metadata::new().with(SERVER_ID, "server-a"))
                .await
                .unwrap();
            established.source.recv_frame().await.unwrap()
        });

        let mut client = connect_with_metadata(&addr, Metadata::new().with(AGENT_ID, "agent-1"))
            .await
            .unwrap();
        assert_eq!(client.metadata.get(SERVER_ID), Some("server-a"));

        let frame = Frame::from(Packet::DialClose { random: 11 });
        client.sink.send_frame(frame.clone()).await.unwrap();

        assert_eq!(server.await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_handshake_reject() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let pending = accept_handshake(stream, HANDSHAKE_TIMEOUT).await.unwrap();
            pending.reject("missing agentID").await.unwrap();
        });

        let result = connect_with_metadata(&addr, Metadata::new()).await;
        match result {
            Err(TransportError::Rejected(reason)) => assert_eq!(reason, "missing agentID"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accept_requires_open_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = FramedStream::new(stream);
            framed.send_frame(Frame::Ping { timestamp: 1 }).await.unwrap();
            // Keep the stream open until the server has read the frame
            let _ = framed.recv_frame().await;
        });

        let (stream, _) = listener.accept().await.unwrap();
        let result = accept_handshake(stream, HANDSHAKE_TIMEOUT).await;
        assert!(matches!(result, Err(TransportError::ProtocolError(_))));
        client.abort();
    }
}
