//! Client side of the connection manager.
//!
//! A [`Socket`] owns a list of transports and at most one stream. `connect`
//! walks the candidate endpoints in order and keeps the first stream any
//! matching transport produces:
//!
//! ```text
//! candidates:  udp-session://a   tcp://a   udp-session://b
//!                   │ timeout       │ ok
//!                   ▼               ▼
//!                fallback ──────▶ bound (udp-session://b never tried)
//! ```

use crate::error::{AttemptFailure, FailedAttempt, NetError, Result};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_transport::{BoxedStream, ConnectionInfo, Transport};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Lifecycle notifications published by a [`Socket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A stream was bound; carries the remote address
    Connected(ConnectionInfo),
    /// The write side was closed
    Ended,
    /// The stream was torn down and unbound
    Destroyed,
}

/// Duplex byte stream established through candidate fallback.
///
/// Reads and writes go straight to the bound transport stream. On an
/// unbound socket they fail with `NotConnected`.
pub struct Socket {
    transports: Vec<Arc<dyn Transport>>,
    stream: Option<BoxedStream>,
    remote_address: Option<ConnectionInfo>,
    events: broadcast::Sender<SocketEvent>,
}

impl Socket {
    /// Unbound socket that will connect through `transports`.
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            transports,
            stream: None,
            remote_address: None,
            events,
        }
    }

    /// Socket bound to an accepted stream.
    pub(crate) fn accepted(
        transports: Vec<Arc<dyn Transport>>,
        stream: BoxedStream,
        peer: ConnectionInfo,
    ) -> Self {
        let mut socket = Self::new(transports);
        socket.bind(stream, peer);
        socket
    }

    /// Whether a stream is bound.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connection info of the peer, once connected.
    #[must_use]
    pub fn remote_address(&self) -> Option<&ConnectionInfo> {
        self.remote_address.as_ref()
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Connect to the first candidate that produces a stream.
    ///
    /// Candidates are tried one at a time, in order, each through every
    /// transport whose type matches. An attempt that exceeds its transport's
    /// connect timeout, or fails outright, falls through to the next one.
    /// Candidates after the winner are never tried.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty candidate list, `State` if already
    /// connected, `Exhausted` when no attempt produced a stream.
    pub async fn connect(&mut self, candidates: &[ConnectionInfo]) -> Result<()> {
        if candidates.is_empty() {
            return Err(NetError::Validation("no connection candidates".into()));
        }
        if self.stream.is_some() {
            return Err(NetError::State("socket is already connected".into()));
        }

        let transports = self.transports.clone();
        let mut failures = Vec::new();
        for endpoint in candidates {
            let Some(transport) = transports
                .iter()
                .find(|t| endpoint.is_for(t.transport_type()))
            else {
                tracing::debug!("no transport for candidate {}", endpoint);
                continue;
            };
            let limit = transport.connect_timeout();
            tracing::debug!(transport = %endpoint.transport_type, "trying {}", endpoint);

            let failure = match timeout(limit, transport.connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!("connected to {}", endpoint);
                    self.bind(stream, endpoint.clone());
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::debug!("connect to {} failed: {}", endpoint, e);
                    AttemptFailure::Failed(e)
                }
                Err(_) => {
                    tracing::debug!("connect to {} timed out after {:?}", endpoint, limit);
                    AttemptFailure::TimedOut(limit)
                }
            };
            failures.push(FailedAttempt {
                endpoint: endpoint.clone(),
                failure,
            });
        }

        tracing::warn!("all {} connection attempts failed", failures.len());
        Err(NetError::Exhausted { attempts: failures })
    }

    /// Close the write side. The socket stays readable.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to signal the half-close.
    pub async fn end(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream
            .shutdown()
            .await
            .map_err(|e| NetError::Transport(e.into()))?;
        let _ = self.events.send(SocketEvent::Ended);
        Ok(())
    }

    /// Tear the stream down and unbind it.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to tear the stream down. The
    /// stream is unbound either way.
    pub async fn destroy(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let result = stream.destroy().await;
        let _ = self.events.send(SocketEvent::Destroyed);
        result.map_err(NetError::from)
    }

    fn bind(&mut self, stream: BoxedStream, remote: ConnectionInfo) {
        self.stream = Some(stream);
        self.remote_address = Some(remote.clone());
        let _ = self.events.send(SocketEvent::Connected(remote));
    }

    fn stream_mut(&mut self) -> io::Result<&mut BoxedStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, NetError::NotConnected))
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("transports", &self.transports.len())
            .field("connected", &self.is_connected())
            .field("remote_address", &self.remote_address)
            .finish()
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
