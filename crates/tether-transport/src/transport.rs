//! Transport trait abstraction for multiple transport backends.
//!
//! This module defines the `Transport` trait consumed by the connection
//! manager. Every backend (UDP sessions, TCP, relayed transports) exposes the
//! same surface: a type tag used for candidate matching, a `listen` that
//! reports bound addresses and delivers accepted streams as events, a
//! `connect` producing one duplex stream, and a per-transport connect timeout.

use crate::info::{ConnectionInfo, ListeningInfo};
use crate::udp::PacketError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Endpoint cannot be used by this transport
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Malformed packet on the wire
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Duplex byte stream produced by a transport.
///
/// Half-close is `AsyncWriteExt::shutdown`; `destroy` tears the stream down
/// abruptly and notifies the peer where the transport supports it.
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Connection info of the remote peer.
    fn peer_info(&self) -> ConnectionInfo;

    /// Abort the stream. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError` if the reset notification cannot be sent
    async fn destroy(&mut self) -> TransportResult<()>;
}

/// Boxed transport stream, as handed to the connection manager.
pub type BoxedStream = Box<dyn TransportStream>;

/// Events emitted by a listening transport.
pub enum TransportEvent {
    /// A peer opened a new stream
    Connection {
        /// Accepted stream
        stream: BoxedStream,
        /// Type tag of the transport that accepted it
        transport_type: String,
        /// Remote peer
        peer: ConnectionInfo,
    },
    /// A transport-level failure outside of any single stream
    Error(TransportError),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connection {
                transport_type,
                peer,
                ..
            } => f
                .debug_struct("Connection")
                .field("transport_type", transport_type)
                .field("peer", peer)
                .finish_non_exhaustive(),
            TransportEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Channel on which a listening transport publishes its events.
pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;

/// Async transport trait used by the connection manager.
///
/// Transports are held in a homogeneous list and selected by
/// `transport_type()` equality with a candidate's `transport_type`.
///
/// # Cancellation
///
/// The connection manager cancels a connect attempt that exceeds
/// `connect_timeout()` by dropping its future. Implementations must release
/// everything the attempt allocated when that happens.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Type tag of this transport.
    fn transport_type(&self) -> &str;

    /// Bind the transport and start accepting connections.
    ///
    /// Accepted streams and transport errors are published on `events`.
    ///
    /// # Returns
    /// The addresses this transport is now reachable on
    ///
    /// # Errors
    /// Returns `TransportError` if binding fails
    async fn listen(
        &self,
        info: Option<ListeningInfo>,
        events: TransportEventSink,
    ) -> TransportResult<Vec<ListeningInfo>>;

    /// Open a stream to a remote endpoint.
    ///
    /// # Errors
    /// Returns `TransportError` if the endpoint is unusable or the connection
    /// cannot be established
    async fn connect(&self, endpoint: &ConnectionInfo) -> TransportResult<BoxedStream>;

    /// How long the connection manager waits for `connect` before falling back.
    fn connect_timeout(&self) -> Duration;

    /// Stop accepting new incoming connections. Existing streams are unaffected.
    fn block_incoming(&self);

    /// Stop listening and release the bound address.
    ///
    /// Drops the event sink handed to `listen`, so a later `listen` can bind
    /// again. A no-op when the transport is not listening.
    fn unlisten(&self);

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Packets dropped (malformed, wrong version, unknown session, full session queue)
    pub packets_dropped: u64,
    /// Incoming connections handed to the listener
    pub connections_accepted: u64,
}
