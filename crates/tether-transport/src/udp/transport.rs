//! UDP session transport.
//!
//! Owns the shared UDP sockets and their receive path: inbound packets are
//! demultiplexed by session id onto [`UdpStream`]s, `SYN` opens a session on
//! the listening socket, and `SYN_ACK` completes an outbound handshake.
//! Outbound sessions use the listening socket when one is bound, so the peer
//! sees the advertised address; otherwise one lazily bound client socket per
//! address family is shared by all outbound sessions.

use super::packet::{MAX_DATAGRAM_SIZE, Packet, PacketType, generate_session_id};
use super::stream::{SessionTable, UdpStream};
use super::{DEFAULT_VERSION, UDP_SESSION_TYPE};
use crate::info::{ConnectionInfo, ListeningInfo};
use crate::transport::{
    BoxedStream, Transport, TransportError, TransportEvent, TransportEventSink, TransportResult,
    TransportStats,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};

/// Default UDP connect timeout
pub const DEFAULT_UDP_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Socket buffer size for shared session sockets (2 MB)
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// UDP session transport configuration
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Address to listen on when `listen` gets no listening info
    pub bind_addr: SocketAddr,
    /// Connect timeout used by the connection manager
    pub connect_timeout: Duration,
    /// Protocol version stamped on every packet; packets with another version are dropped
    pub version: String,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            connect_timeout: DEFAULT_UDP_CONNECT_TIMEOUT,
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

#[derive(Default)]
struct Counters {
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    connections_accepted: AtomicU64,
}

struct Shared {
    version: String,
    sessions: Arc<SessionTable>,
    pending: Mutex<HashMap<String, Handshake>>,
    listener: Mutex<Option<Arc<UdpSocket>>>,
    client_v4: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    client_v6: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    events: Mutex<Option<TransportEventSink>>,
    blocked: AtomicBool,
    counters: Counters,
}

/// Outbound handshake waiting for `SYN_ACK`.
struct Handshake {
    reply: oneshot::Sender<SocketAddr>,
    /// Sent from the listening socket, so it dies with the listener
    via_listener: bool,
}

/// Transport running the UDP session protocol over shared sockets.
pub struct UdpTransport {
    config: UdpTransportConfig,
    shared: Arc<Shared>,
    /// Stops the client socket receive loops when the transport is dropped
    shutdown: watch::Sender<bool>,
    /// Stops the listening socket's receive loop
    listen_stop: Mutex<Option<watch::Sender<bool>>>,
}

/// Removes a pending handshake when the connect attempt finishes or is dropped.
struct PendingHandshake<'a> {
    shared: &'a Shared,
    session_id: String,
}

impl Drop for PendingHandshake<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.session_id);
    }
}

impl UdpTransport {
    /// Create a new, unbound UDP session transport.
    #[must_use]
    pub fn new(config: UdpTransportConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            version: config.version.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            client_v4: tokio::sync::Mutex::new(None),
            client_v6: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            blocked: AtomicBool::new(false),
            counters: Counters::default(),
        });
        Self {
            config,
            shared,
            shutdown,
            listen_stop: Mutex::new(None),
        }
    }

    /// Number of live sessions across all sockets.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Number of outbound handshakes awaiting `SYN_ACK`.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Socket used for an outbound session to `peer`.
    async fn outbound_socket(&self, peer: SocketAddr) -> TransportResult<Arc<UdpSocket>> {
        let listener = self.shared.listener.lock().clone();
        if let Some(listener) = listener {
            let local = listener.local_addr()?;
            if local.is_ipv4() == peer.is_ipv4() {
                return Ok(listener);
            }
        }

        let slot = if peer.is_ipv4() {
            &self.shared.client_v4
        } else {
            &self.shared.client_v6
        };
        let mut slot = slot.lock().await;
        if let Some(socket) = slot.as_ref() {
            return Ok(socket.clone());
        }

        let any = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = Arc::new(bind_socket(any)?);
        tracing::debug!(local = %socket.local_addr()?, "bound udp client socket");
        self.spawn_receiver(socket.clone(), self.shutdown.subscribe(), false);
        *slot = Some(socket.clone());
        Ok(socket)
    }

    fn spawn_receiver(
        &self,
        socket: Arc<UdpSocket>,
        mut shutdown: watch::Receiver<bool>,
        accept: bool,
    ) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            shared.on_datagram(&socket, &buf[..len], from, accept).await;
                        }
                        Err(e) => {
                            tracing::warn!("udp receive error: {}", e);
                            if accept {
                                shared.emit(TransportEvent::Error(TransportError::Io(e)));
                            }
                        }
                    },
                }
            }
            tracing::debug!("udp receive loop stopped");
        });
    }
}

impl Shared {
    async fn on_datagram(&self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr, accept: bool) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("dropping malformed packet from {}: {}", from, e);
                self.drop_packet();
                return;
            }
        };
        if packet.version != self.version {
            tracing::debug!(
                "dropping packet from {} with version {:?} (expected {:?})",
                from,
                packet.version,
                self.version
            );
            self.drop_packet();
            return;
        }

        match packet.packet_type {
            PacketType::Syn => self.on_syn(socket, packet, from, accept).await,
            PacketType::SynAck => {
                let waiter = self.pending.lock().remove(&packet.session_id);
                match waiter {
                    Some(handshake) => {
                        let _ = handshake.reply.send(from);
                    }
                    None => self.unknown_session(&packet, from),
                }
            }
            PacketType::Data => {
                let inbox = self.sessions.lock().get(&packet.session_id).cloned();
                match inbox {
                    Some(inbox) => {
                        if !inbox.push(packet.payload) {
                            tracing::trace!(session_id = %packet.session_id, "session queue full");
                            self.drop_packet();
                        }
                    }
                    None => self.unknown_session(&packet, from),
                }
            }
            PacketType::Fin => {
                let inbox = self.sessions.lock().get(&packet.session_id).cloned();
                match inbox {
                    Some(inbox) => {
                        tracing::debug!(session_id = %packet.session_id, "peer ended udp session");
                        inbox.push_eof();
                    }
                    None => self.unknown_session(&packet, from),
                }
            }
            PacketType::Rst => {
                let inbox = self.sessions.lock().remove(&packet.session_id);
                match inbox {
                    Some(inbox) => {
                        tracing::debug!(session_id = %packet.session_id, "peer reset udp session");
                        inbox.reset();
                    }
                    None => self.unknown_session(&packet, from),
                }
            }
        }
    }

    async fn on_syn(&self, socket: &UdpSocket, packet: Packet, from: SocketAddr, accept: bool) {
        let known = self.sessions.lock().contains_key(&packet.session_id);
        if !known {
            if !accept || self.blocked.load(Ordering::Relaxed) {
                tracing::debug!("ignoring SYN from {}: not accepting connections", from);
                self.drop_packet();
                return;
            }
            let Some(listener) = self.listener.lock().clone() else {
                self.drop_packet();
                return;
            };

            let (mut stream, inbox) = UdpStream::new(
                from,
                Some(packet.session_id.clone()),
                listener,
                self.version.as_str(),
            );
            stream.attach(&self.sessions);
            self.sessions.lock().insert(packet.session_id.clone(), inbox);

            self.counters
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id = %packet.session_id, peer = %from, "accepted udp session");
            self.emit(TransportEvent::Connection {
                stream: Box::new(stream),
                transport_type: UDP_SESSION_TYPE.to_string(),
                peer: ConnectionInfo::socket(UDP_SESSION_TYPE, from),
            });
        }

        // Duplicate SYNs get the SYN_ACK again
        let syn_ack = Packet::control(PacketType::SynAck, packet.session_id, self.version.as_str());
        if let Err(e) = socket.send_to(&syn_ack.encode(), from).await {
            tracing::warn!("failed to send SYN_ACK to {}: {}", from, e);
        }
    }

    fn unknown_session(&self, packet: &Packet, from: SocketAddr) {
        tracing::debug!(
            session_id = %packet.session_id,
            "dropping {:?} from {} for unknown session",
            packet.packet_type,
            from
        );
        self.drop_packet();
    }

    fn drop_packet(&self) {
        self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.events.lock().clone();
        match sink {
            Some(sink) => {
                if sink.send(event).is_err() {
                    tracing::debug!("udp transport listener gone, dropping event");
                }
            }
            None => tracing::debug!("udp transport not listening, dropping event"),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn transport_type(&self) -> &str {
        UDP_SESSION_TYPE
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
        if self.shared.listener.lock().is_some() {
            return Err(TransportError::BindFailed("already listening".to_string()));
        }

        let socket = Arc::new(bind_socket(addr)?);
        let local = socket.local_addr()?;
        let (stop, stopped) = watch::channel(false);
        *self.shared.events.lock() = Some(events);
        *self.shared.listener.lock() = Some(socket.clone());
        *self.listen_stop.lock() = Some(stop);
        self.shared.blocked.store(false, Ordering::Relaxed);
        self.spawn_receiver(socket, stopped, true);

        tracing::debug!(transport = UDP_SESSION_TYPE, local = %local, "listening");
        Ok(vec![ConnectionInfo::socket(UDP_SESSION_TYPE, local)])
    }

    async fn connect(&self, endpoint: &ConnectionInfo) -> TransportResult<BoxedStream> {
        let peer = endpoint.socket_addr().ok_or_else(|| {
            TransportError::InvalidEndpoint(format!("{endpoint} has no socket address"))
        })?;
        let socket = self.outbound_socket(peer).await?;

        let session_id = generate_session_id();
        let via_listener = self
            .shared
            .listener
            .lock()
            .as_ref()
            .is_some_and(|listener| Arc::ptr_eq(listener, &socket));
        let (reply, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            session_id.clone(),
            Handshake {
                reply,
                via_listener,
            },
        );
        let _pending = PendingHandshake {
            shared: &self.shared,
            session_id: session_id.clone(),
        };

        // Registered before SYN so DATA racing the SYN_ACK is not lost
        let (mut stream, inbox) = UdpStream::new(
            peer,
            Some(session_id.clone()),
            socket.clone(),
            self.config.version.as_str(),
        );
        stream.attach(&self.shared.sessions);
        self.shared.sessions.lock().insert(session_id.clone(), inbox);

        let syn = Packet::control(PacketType::Syn, session_id.as_str(), self.config.version.as_str());
        socket.send_to(&syn.encode(), peer).await?;

        // The waiter is only dropped unanswered when the listener goes away
        let from = rx.await.map_err(|_| TransportError::Closed)?;
        tracing::debug!(session_id = %session_id, peer = %from, "udp session established");
        Ok(Box::new(stream))
    }

    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    fn block_incoming(&self) {
        tracing::debug!(transport = UDP_SESSION_TYPE, "blocking incoming connections");
        self.shared.blocked.store(true, Ordering::Relaxed);
    }

    fn unlisten(&self) {
        // Dropping the stop sender ends the receive loop
        if self.listen_stop.lock().take().is_none() {
            return;
        }
        let listener = self.shared.listener.lock().take();
        self.shared.events.lock().take();
        self.shared
            .pending
            .lock()
            .retain(|_, handshake| !handshake.via_listener);
        if let Some(listener) = listener.and_then(|l| l.local_addr().ok()) {
            tracing::debug!(transport = UDP_SESSION_TYPE, local = %listener, "stopped listening");
        }
    }

    fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            packets_dropped: c.packets_dropped.load(Ordering::Relaxed),
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
        }
    }
}

/// Bind a non-blocking UDP socket with enlarged buffers.
fn bind_socket(addr: SocketAddr) -> TransportResult<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };

    let socket2 = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    // Buffer sizes are a hint; the kernel may clamp them
    if let Err(e) = socket2.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("could not set udp receive buffer: {}", e);
    }
    if let Err(e) = socket2.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("could not set udp send buffer: {}", e);
    }

    socket2
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
    socket2
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket2.into();
    UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::SESSION_QUEUE_DEPTH;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn loopback_config() -> UdpTransportConfig {
        UdpTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..UdpTransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_listen_reports_bound_address() {
        let transport = UdpTransport::new(loopback_config());
        let (tx, _rx) = mpsc::unbounded_channel();

        let infos = transport.listen(None, tx).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_for(UDP_SESSION_TYPE));
        assert_ne!(infos[0].socket_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let transport = UdpTransport::new(loopback_config());
        let (tx, _rx) = mpsc::unbounded_channel();

        transport.listen(None, tx.clone()).await.unwrap();
        let err = transport.listen(None, tx).await.unwrap_err();
        assert!(matches!(err, TransportError::BindFailed(_)));
    }

    #[tokio::test]
    async fn test_listen_rejects_rendezvous_info() {
        let transport = UdpTransport::new(loopback_config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let info = ConnectionInfo::rendezvous(UDP_SESSION_TYPE, "uid", "tcp://x:1");

        let err = transport.listen(Some(info), tx).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn test_handshake_and_echo() {
        let server = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let infos = server.listen(None, tx).await.unwrap();

        let client = UdpTransport::new(loopback_config());
        let mut outbound = timeout(Duration::from_secs(2), client.connect(&infos[0]))
            .await
            .expect("handshake timed out")
            .unwrap();

        let Some(TransportEvent::Connection { mut stream, peer, .. }) = rx.recv().await else {
            panic!("expected connection event");
        };
        assert!(peer.is_for(UDP_SESSION_TYPE));

        outbound.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");

        stream.write_all(b"world").await.unwrap();
        timeout(Duration::from_secs(1), outbound.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"world");

        outbound.shutdown().await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(1), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        assert_eq!(server.stats().connections_accepted, 1);
    }

    #[tokio::test]
    async fn test_peer_reset_surfaces_on_read() {
        let server = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let infos = server.listen(None, tx).await.unwrap();

        let client = UdpTransport::new(loopback_config());
        let mut outbound = client.connect(&infos[0]).await.unwrap();
        let Some(TransportEvent::Connection { mut stream, .. }) = rx.recv().await else {
            panic!("expected connection event");
        };

        outbound.destroy().await.unwrap();
        let mut buf = [0u8; 4];
        let err = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_blocked_listener_ignores_syn() {
        let server = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let infos = server.listen(None, tx).await.unwrap();
        server.block_incoming();

        let client = UdpTransport::new(loopback_config());
        let attempt = timeout(Duration::from_millis(200), client.connect(&infos[0])).await;
        assert!(attempt.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_connect_releases_session() {
        // Nobody answers on this socket
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ConnectionInfo::socket(UDP_SESSION_TYPE, silent.local_addr().unwrap());

        let client = UdpTransport::new(loopback_config());
        let attempt = timeout(Duration::from_millis(100), client.connect(&endpoint)).await;
        assert!(attempt.is_err());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unlisten_releases_binding() {
        let transport = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.listen(None, tx).await.unwrap();

        transport.unlisten();
        transport.unlisten();
        // The sink was dropped with the listener
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let infos = transport.listen(None, tx).await.unwrap();
        assert_eq!(infos.len(), 1);
    }

    #[tokio::test]
    async fn test_unlisten_abandons_handshake_on_listener() {
        let transport = UdpTransport::new(loopback_config());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.listen(None, tx).await.unwrap();

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ConnectionInfo::socket(UDP_SESSION_TYPE, silent.local_addr().unwrap());
        let (result, ()) = tokio::join!(transport.connect(&endpoint), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            transport.unlisten();
        });

        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_session_queue_counts_drops() {
        let server = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let infos = server.listen(None, tx).await.unwrap();
        let server_addr = infos[0].socket_addr().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let syn = Packet::control(PacketType::Syn, "flood", "1").encode();
        raw.send_to(&syn, server_addr).await.unwrap();
        // Held but never read
        let Some(TransportEvent::Connection { stream: _stream, .. }) = rx.recv().await else {
            panic!("expected connection event");
        };

        let overflow = 20;
        let data = Packet::data("flood", "1", &b"x"[..]).encode();
        for i in 0..SESSION_QUEUE_DEPTH + overflow {
            raw.send_to(&data, server_addr).await.unwrap();
            if i % 32 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let expected = (1 + SESSION_QUEUE_DEPTH + overflow) as u64;
        timeout(Duration::from_secs(2), async {
            while server.stats().packets_received < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.stats().packets_dropped, overflow as u64);
    }

    #[tokio::test]
    async fn test_wrong_version_dropped() {
        let server = UdpTransport::new(loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let infos = server.listen(None, tx).await.unwrap();
        let server_addr = infos[0].socket_addr().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let syn = Packet::control(PacketType::Syn, "abcd", "99").encode();
        raw.send_to(&syn, server_addr).await.unwrap();
        raw.send_to(b"\x7f", server_addr).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(timeout(Duration::from_millis(200), raw.recv(&mut buf)).await.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(server.stats().packets_dropped, 2);
    }
}
