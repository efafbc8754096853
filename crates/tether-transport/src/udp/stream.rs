//! Duplex stream over a shared UDP socket.
//!
//! A [`UdpStream`] is one session of the UDP session protocol. Writes are
//! framed as DATA packets and sent straight to the peer; a write completes
//! when the datagram has been handed to the socket. There is no
//! acknowledgment, retransmission or reordering: a lost datagram is lost.
//!
//! The readable side never touches the network. Whoever owns the socket's
//! receive path pushes payloads through the [`SessionInbox`] returned by
//! [`UdpStream::new`]. At most [`SESSION_QUEUE_DEPTH`] payloads wait for the
//! reader; anything beyond that is dropped like a lost datagram.

use super::packet::{Packet, PacketType, MAX_DATA_PAYLOAD, generate_session_id};
use super::UDP_SESSION_TYPE;
use crate::info::ConnectionInfo;
use crate::transport::{TransportResult, TransportStream};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Payloads queued for a reader before further DATA is dropped.
pub const SESSION_QUEUE_DEPTH: usize = 256;

// How the peer ended its side, ordered so a reset overrides an end
const PEER_OPEN: u8 = 0;
const PEER_EOF: u8 = 1;
const PEER_RESET: u8 = 2;

/// Sessions sharing one socket, keyed by session id.
pub(crate) type SessionTable = Mutex<HashMap<String, SessionInbox>>;

/// Lifecycle of a UDP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both directions usable
    Open,
    /// FIN sent, writes rejected
    HalfClosed,
    /// RST sent, session finalized
    Destroyed,
}

#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    /// Wakes the reader to look at the peer end flag
    Wake,
}

/// Push handle for the readable side of a [`UdpStream`].
#[derive(Debug, Clone)]
pub struct SessionInbox {
    tx: mpsc::Sender<Inbound>,
    peer_end: Arc<AtomicU8>,
}

impl SessionInbox {
    /// Deliver payload bytes.
    ///
    /// Returns `false` if the payload was dropped, either because the stream
    /// is gone or because its queue is full.
    pub fn push(&self, payload: Bytes) -> bool {
        self.tx.try_send(Inbound::Data(payload)).is_ok()
    }

    /// Signal that the peer half-closed (FIN received).
    pub fn push_eof(&self) -> bool {
        self.signal_end(PEER_EOF)
    }

    /// Signal that the peer reset the session (RST received).
    ///
    /// Reads fail with `ConnectionReset` once queued payloads are consumed,
    /// and writes fail right away.
    pub fn reset(&self) -> bool {
        self.signal_end(PEER_RESET)
    }

    fn signal_end(&self, end: u8) -> bool {
        // Flag first: a reader draining a full queue checks it once empty
        self.peer_end.fetch_max(end, Ordering::SeqCst);
        match self.tx.try_send(Inbound::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the stream has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One session of the UDP session protocol.
pub struct UdpStream {
    peer: SocketAddr,
    session_id: String,
    version: String,
    socket: Arc<UdpSocket>,
    state: watch::Sender<SessionState>,
    inbound: mpsc::Receiver<Inbound>,
    peer_end: Arc<AtomicU8>,
    read_buf: Bytes,
    read_closed: bool,
    table: Option<Weak<SessionTable>>,
}

impl UdpStream {
    /// Create a session with `peer` over the shared `socket`.
    ///
    /// A fresh random session id is generated when `session_id` is `None`.
    /// The returned inbox feeds the readable side.
    pub fn new(
        peer: SocketAddr,
        session_id: Option<String>,
        socket: Arc<UdpSocket>,
        version: impl Into<String>,
    ) -> (Self, SessionInbox) {
        let (tx, inbound) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let peer_end = Arc::new(AtomicU8::new(PEER_OPEN));
        let (state, _) = watch::channel(SessionState::Open);
        let stream = Self {
            peer,
            session_id: session_id.unwrap_or_else(generate_session_id),
            version: version.into(),
            socket,
            state,
            inbound,
            peer_end: peer_end.clone(),
            read_buf: Bytes::new(),
            read_closed: false,
            table: None,
        };
        tracing::debug!(session_id = %stream.session_id, peer = %peer, "created udp session");
        (stream, SessionInbox { tx, peer_end })
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Protocol version carried in every packet
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Remote peer address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions. `Destroyed` is the close notification.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Remove this session from `table` when the stream is dropped or destroyed.
    pub(crate) fn attach(&mut self, table: &Arc<SessionTable>) {
        self.table = Some(Arc::downgrade(table));
    }

    /// Send RST and finalize the session.
    ///
    /// The state flips to [`SessionState::Destroyed`] as soon as the RST send
    /// completes. Nothing is sent for this session afterwards.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the RST cannot be sent
    pub async fn reset(&mut self) -> TransportResult<()> {
        if self.peer_reset() || self.state() == SessionState::Destroyed {
            return Ok(());
        }
        tracing::debug!(session_id = %self.session_id, "destroying udp session");
        let packet = self.control_packet(PacketType::Rst);
        self.socket.send_to(&packet, self.peer).await?;

        self.state.send_replace(SessionState::Destroyed);
        self.detach();
        Ok(())
    }

    /// Finalize the session if the peer reset it. Returns whether it did.
    fn peer_reset(&mut self) -> bool {
        if self.peer_end.load(Ordering::SeqCst) != PEER_RESET {
            return false;
        }
        if self.state() != SessionState::Destroyed {
            tracing::debug!(session_id = %self.session_id, "udp session reset by peer");
            self.state.send_replace(SessionState::Destroyed);
            self.detach();
        }
        true
    }

    fn control_packet(&self, packet_type: PacketType) -> Bytes {
        Packet::control(packet_type, self.session_id.as_str(), self.version.as_str()).encode()
    }

    fn detach(&mut self) {
        if let Some(table) = self.table.take().and_then(|t| t.upgrade()) {
            table.lock().remove(&self.session_id);
        }
    }
}

impl Drop for UdpStream {
    fn drop(&mut self) {
        self.detach();
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(Inbound::Data(payload))) => this.read_buf = payload,
                Poll::Ready(Some(Inbound::Wake)) => {}
                Poll::Ready(None) => this.read_closed = true,
                // Queue drained: only now does the peer's end take effect
                Poll::Pending => match this.peer_end.load(Ordering::SeqCst) {
                    PEER_OPEN => return Poll::Pending,
                    PEER_EOF => this.read_closed = true,
                    _ => {
                        this.read_closed = true;
                        this.peer_reset();
                        return Poll::Ready(Err(reset_error()));
                    }
                },
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.peer_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        if this.state() != SessionState::Open {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "udp session no longer writable",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = buf.len().min(MAX_DATA_PAYLOAD);
        let packet = Packet::data(
            this.session_id.as_str(),
            this.version.as_str(),
            Bytes::copy_from_slice(&buf[..len]),
        )
        .encode();
        ready!(this.socket.poll_send_to(cx, &packet, this.peer))?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Sends one FIN, then rejects further writes.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.peer_reset() || this.state() != SessionState::Open {
            return Poll::Ready(Ok(()));
        }
        let packet = this.control_packet(PacketType::Fin);
        ready!(this.socket.poll_send_to(cx, &packet, this.peer))?;

        tracing::debug!(session_id = %this.session_id, "ended udp session");
        this.state.send_replace(SessionState::HalfClosed);
        Poll::Ready(Ok(()))
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "udp session reset by peer")
}

#[async_trait]
impl TransportStream for UdpStream {
    fn peer_info(&self) -> ConnectionInfo {
        ConnectionInfo::socket(UDP_SESSION_TYPE, self.peer)
    }

    async fn destroy(&mut self) -> TransportResult<()> {
        self.reset().await
    }
}
