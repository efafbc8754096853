//! In-memory transport for connection manager tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tether_transport::{
    BoxedStream, ConnectionInfo, ListeningInfo, Transport, TransportError, TransportEvent,
    TransportEventSink, TransportResult, TransportStream,
};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// How `connect` behaves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    /// Never resolves
    Hang,
    /// Resolves with a stream after the delay
    Succeed(Duration),
    /// Fails immediately
    Refuse,
}

pub(crate) struct MockStream {
    inner: DuplexStream,
    peer: ConnectionInfo,
    destroyed: Arc<AtomicBool>,
}

impl MockStream {
    /// Stream connected to the returned far end.
    pub(crate) fn pair(peer: ConnectionInfo) -> (Self, DuplexStream) {
        let (inner, far) = tokio::io::duplex(4096);
        let stream = Self {
            inner,
            peer,
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        (stream, far)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
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
impl TransportStream for MockStream {
    fn peer_info(&self) -> ConnectionInfo {
        self.peer.clone()
    }

    async fn destroy(&mut self) -> TransportResult<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockTransport {
    kind: &'static str,
    behavior: Behavior,
    timeout: Duration,
    pub(crate) attempts: AtomicUsize,
    pub(crate) blocked: AtomicBool,
    pub(crate) unlistened: AtomicUsize,
    fail_listen: bool,
    sink: Mutex<Option<TransportEventSink>>,
    far_ends: Mutex<Vec<DuplexStream>>,
    destroyed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockTransport {
    pub(crate) fn new(kind: &'static str, behavior: Behavior, timeout: Duration) -> Arc<Self> {
        Arc::new(Self::build(kind, behavior, timeout, false))
    }

    pub(crate) fn failing_listen(kind: &'static str) -> Arc<Self> {
        Arc::new(Self::build(kind, Behavior::Refuse, Duration::from_millis(10), true))
    }

    fn build(kind: &'static str, behavior: Behavior, timeout: Duration, fail_listen: bool) -> Self {
        Self {
            kind,
            behavior,
            timeout,
            attempts: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            unlistened: AtomicUsize::new(0),
            fail_listen,
            sink: Mutex::new(None),
            far_ends: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Whether `listen` handed this transport an event sink it still holds.
    pub(crate) fn is_listening(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of outbound streams that were destroyed.
    pub(crate) fn destroyed_count(&self) -> usize {
        self.destroyed
            .lock()
            .iter()
            .filter(|flag| flag.load(Ordering::SeqCst))
            .count()
    }

    pub(crate) fn address(&self) -> ConnectionInfo {
        ConnectionInfo::socket(self.kind, SocketAddr::from(([127, 0, 0, 1], 1)))
    }

    /// Publish an inbound connection as if a peer had connected.
    pub(crate) fn inject(&self, peer: SocketAddr) -> DuplexStream {
        let peer = ConnectionInfo::socket(self.kind, peer);
        let (stream, far) = MockStream::pair(peer.clone());
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(TransportEvent::Connection {
                stream: Box::new(stream),
                transport_type: self.kind.to_string(),
                peer,
            });
        }
        far
    }

    /// Publish a transport error.
    pub(crate) fn inject_error(&self, message: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(TransportEvent::Error(TransportError::Other(
                message.to_string(),
            )));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        self.kind
    }

    async fn listen(
        &self,
        info: Option<ListeningInfo>,
        events: TransportEventSink,
    ) -> TransportResult<Vec<ListeningInfo>> {
        if self.fail_listen {
            return Err(TransportError::BindFailed("mock".to_string()));
        }
        *self.sink.lock() = Some(events);
        Ok(vec![info.unwrap_or_else(|| self.address())])
    }

    async fn connect(&self, endpoint: &ConnectionInfo) -> TransportResult<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                let (stream, far) = MockStream::pair(endpoint.clone());
                self.far_ends.lock().push(far);
                self.destroyed.lock().push(stream.destroyed.clone());
                Ok(Box::new(stream))
            }
            Behavior::Refuse => Err(TransportError::ConnectionFailed("refused".to_string())),
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.timeout
    }

    fn block_incoming(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    fn unlisten(&self) {
        if self.sink.lock().take().is_some() {
            self.unlistened.fetch_add(1, Ordering::SeqCst);
        }
    }
}
