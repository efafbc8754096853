//! TCP transport.
//!
//! Thin wrap over tokio TCP sockets so that direct TCP can take part in
//! candidate fallback next to the UDP session transport.

use crate::info::{ConnectionInfo, ListeningInfo};
use crate::transport::{
    BoxedStream, Transport, TransportError, TransportEvent, TransportEventSink, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Transport type tag of the TCP transport
pub const TCP_TYPE: &str = "tcp";

/// Default TCP connect timeout
pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to listen on when `listen` gets no listening info
    pub bind_addr: SocketAddr,
    /// Connect timeout used by the connection manager
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on every stream
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

/// TCP connection as a transport stream.
pub struct TcpSessionStream {
    inner: TcpStream,
    peer: SocketAddr,
    destroyed: bool,
}

impl TcpSessionStream {
    fn new(inner: TcpStream, peer: SocketAddr) -> Self {
        Self {
            inner,
            peer,
            destroyed: false,
        }
    }
}

impl AsyncRead for TcpSessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpSessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpSessionStream {
    fn peer_info(&self) -> ConnectionInfo {
        ConnectionInfo::socket(TCP_TYPE, self.peer)
    }

    async fn destroy(&mut self) -> TransportResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

/// Direct TCP transport.
pub struct TcpTransport {
    config: TcpTransportConfig,
    blocked: Arc<AtomicBool>,
    /// One stop signal per running accept loop
    accept_loops: Mutex<Vec<watch::Sender<bool>>>,
}

impl TcpTransport {
    /// Create a new, unbound TCP transport.
    #[must_use]
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            blocked: Arc::new(AtomicBool::new(false)),
            accept_loops: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        TCP_TYPE
    }

    async fn listen(
        &self,
        info: Option<ListeningInfo>,
        events: TransportEventSink,
    ) -> TransportResult<Vec<ListeningInfo>> {
        let addr = match info {
            Some(info) => info.socket_addr().ok_or_else(|| {
                TransportError::InvalidEndpoint(format!("{info} has no socket address"))
            })?,
            None => self.config.bind_addr,
        };
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let local = listener.local_addr()?;
        self.blocked.store(false, Ordering::Relaxed);

        let blocked = self.blocked.clone();
        let nodelay = self.config.nodelay;
        let (stop, mut shutdown) = watch::channel(false);
        self.accept_loops.lock().push(stop);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if blocked.load(Ordering::Relaxed) {
                                tracing::debug!("refusing tcp connection from {}: not accepting", peer);
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(nodelay) {
                                tracing::debug!("could not set TCP_NODELAY: {}", e);
                            }
                            tracing::debug!(transport = TCP_TYPE, peer = %peer, "accepted connection");
                            let event = TransportEvent::Connection {
                                stream: Box::new(TcpSessionStream::new(stream, peer)),
                                transport_type: TCP_TYPE.to_string(),
                                peer: ConnectionInfo::socket(TCP_TYPE, peer),
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("tcp accept error: {}", e);
                            if events.send(TransportEvent::Error(TransportError::Io(e))).is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            tracing::debug!(transport = TCP_TYPE, "accept loop stopped");
        });

        tracing::debug!(transport = TCP_TYPE, local = %local, "listening");
        Ok(vec![ConnectionInfo::socket(TCP_TYPE, local)])
    }

    async fn connect(&self, endpoint: &ConnectionInfo) -> TransportResult<BoxedStream> {
        let peer = endpoint.socket_addr().ok_or_else(|| {
            TransportError::InvalidEndpoint(format!("{endpoint} has no socket address"))
        })?;
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{peer}: {e}")))?;
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            tracing::debug!("could not set TCP_NODELAY: {}", e);
        }
        tracing::debug!(transport = TCP_TYPE, peer = %peer, "connected");
        Ok(Box::new(TcpSessionStream::new(stream, peer)))
    }

    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    fn block_incoming(&self) {
        tracing::debug!(transport = TCP_TYPE, "blocking incoming connections");
        self.blocked.store(true, Ordering::Relaxed);
    }

    fn unlisten(&self) {
        // Each loop drops its listener and sink once its stop sender is gone
        let stopped = std::mem::take(&mut *self.accept_loops.lock());
        if !stopped.is_empty() {
            tracing::debug!(transport = TCP_TYPE, "stopped listening");
        }
    }
}
