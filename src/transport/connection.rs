//! Framed, closable packet connection over any byte stream.
//!
//! A [`Connection`] owns both halves of a stream (plain TCP, TLS, or an
//! in-memory duplex in tests) behind independent locks, so one task can block
//! in [`Connection::recv`] while others send. Closing cancels pending reads
//! and sends and shuts the write half down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Upper bound on a parting packet and on shutting down the write half
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Any bidirectional byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedTransport = Box<dyn Transport>;

pub struct Connection {
    reader: Mutex<FramedRead<ReadHalf<BoxedTransport>, PacketCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedTransport>, PacketCodec>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    peer_addr: Option<SocketAddr>,
    metrics: Arc<Metrics>,
}

impl Connection {
    pub fn new<T: Transport>(stream: T, codec: PacketCodec) -> Self {
        let stream: BoxedTransport = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec.clone())),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            peer_addr: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Tie this connection to an outer shutdown signal, typically a child token
    /// of the owning server
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    /// Encode and flush one packet.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] once the connection is
    /// closed, including when it closes while this send is waiting.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let name = packet.name();
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.send(packet).await
            } => {
                result?;
                trace!(packet = name, "Sent packet");
                self.metrics.packet_sent();
                Ok(())
            }
        }
    }

    /// Send a parting packet, giving up after [`CLOSE_TIMEOUT`]. Used right
    /// before [`close`](Self::close), which must not wait on a peer that
    /// stopped reading. Failures are logged, never returned.
    pub async fn send_before_close(&self, packet: Packet) {
        let name = packet.name();
        if let Err(e) = with_timeout_error(self.send(packet), CLOSE_TIMEOUT).await {
            debug!(peer = ?self.peer_addr, packet = name, error = %e, "Parting packet not delivered");
        }
    }

    /// Next packet from the peer.
    ///
    /// `Ok(None)` means the peer closed the stream or this connection was
    /// closed locally. Decode errors are returned as-is and leave the stream in
    /// an unusable state; callers close the connection on any error.
    pub async fn recv(&self) -> Result<Option<Packet>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(None),
            next = reader.next() => next.transpose(),
        }
    }

    /// Close the connection. Only the first call does any work; it returns
    /// `true`, later calls return `false`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => debug!(peer = ?self.peer_addr, "Connection closed"),
            Ok(Err(e)) => debug!(peer = ?self.peer_addr, error = %e, "Error shutting down connection"),
            Err(_) => debug!(peer = ?self.peer_addr, "Timed out shutting down connection"),
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
