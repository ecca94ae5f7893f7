//! Framed Transport Layer
//!
//! Single responsibility: Connect to one peer and send/receive length-prefixed frames.
//! No knowledge of the session protocol, retries, or peer selection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::config::PeerAddress;
use crate::error::ZkError;

/// Any bidirectional byte stream a transport can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Produces byte-stream connections to peers.
///
/// The default is [`TcpConnector`]; tests substitute in-memory streams.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        peer: &PeerAddress,
        timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, ZkError>;
}

/// Plain TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        peer: &PeerAddress,
        timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, ZkError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((peer.host.as_str(), peer.port)))
            .await
            .map_err(|_| ZkError::Connection(format!("connect to {} timed out", peer)))?
            .map_err(|e| ZkError::Connection(format!("connect to {} failed: {}", peer, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ZkError::Connection(format!("failed to configure socket: {}", e)))?;

        Ok(Box::new(stream))
    }
}

type FramedStream = Framed<Box<dyn ByteStream>, LengthDelimitedCodec>;

/// Type alias for the send half
pub type FrameSink = SplitSink<FramedStream, Bytes>;

/// Type alias for the receive half
pub type FrameStream = SplitStream<FramedStream>;

/// A connected, framed transport.
///
/// This type represents a raw connection with no protocol knowledge.
/// It can only be constructed via `Transport::connect()`.
pub struct Transport {
    peer: PeerAddress,
    framed: FramedStream,
}

impl Transport {
    /// Connect to a peer.
    ///
    /// Returns a Transport only when the connection is established.
    pub async fn connect(
        connector: &dyn Connector,
        peer: &PeerAddress,
        timeout: Duration,
        max_frame_length: usize,
    ) -> Result<Self, ZkError> {
        debug!(peer = %peer, "Connecting");

        let stream = connector.connect(peer, timeout).await?;
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max_frame_length)
            .new_codec();

        debug!(peer = %peer, "Connected");
        Ok(Self {
            peer: peer.clone(),
            framed: Framed::new(stream, codec),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), ZkError> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| ZkError::Connection(format!("failed to send to {}: {}", self.peer, e)))
    }

    /// Receive the next frame.
    ///
    /// Returns None if the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ZkError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(ZkError::Connection(format!(
                "failed to receive from {}: {}",
                self.peer, e
            ))),
            None => Ok(None),
        }
    }

    /// Receive a frame, treating a closed connection as an error.
    pub async fn recv_frame(&mut self) -> Result<Bytes, ZkError> {
        self.recv()
            .await?
            .ok_or_else(|| ZkError::Connection(format!("{} closed the connection", self.peer)))
    }

    /// Flush and shut down the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            debug!(peer = %self.peer, error = %e, "Error while closing transport");
        }
    }

    /// Split into separate sink and stream for concurrent send/receive.
    pub fn split(self) -> (FrameSink, FrameStream) {
        self.framed.split()
    }
}

/// Map a send failure on a split sink.
pub async fn send_frame(sink: &mut FrameSink, frame: Bytes) -> Result<(), ZkError> {
    sink.send(frame)
        .await
        .map_err(|e| ZkError::Connection(format!("failed to send: {}", e)))
}

/// Map the next item of a split stream; `Ok(None)` when the peer closed.
pub async fn recv_frame(stream: &mut FrameStream) -> Result<Option<Bytes>, ZkError> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(frame.freeze())),
        Some(Err(e)) => Err(ZkError::Connection(format!("failed to receive: {}", e))),
        None => Ok(None),
    }
}
