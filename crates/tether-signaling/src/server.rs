//! Rendezvous server relaying signaling messages between registered peers.
//!
//! Peers hold a control channel open and register a uid on it. A signaling
//! message names a destination uid; the server forwards it over the
//! destination's channel and acknowledges the sender once the destination
//! has acknowledged delivery.

use crate::error::{Result, SignalingError};
use crate::wire::{ACK_OK, Ack, Emit, Frame, Message, read_frame, write_frame};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, timeout};

/// Acknowledgment codes used by the server
pub mod codes {
    /// Malformed request
    pub const BAD_REQUEST: &str = "400";
    /// Sender has no registration on this channel
    pub const NOT_REGISTERED: &str = "401";
    /// Unknown uid
    pub const NOT_FOUND: &str = "404";
    /// Uid registered on another channel
    pub const CONFLICT: &str = "409";
    /// Registration limit reached
    pub const UNAVAILABLE: &str = "503";
    /// Destination did not acknowledge in time
    pub const GATEWAY_TIMEOUT: &str = "504";
}

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct RendezvousServerConfig {
    /// Maximum number of registered uids
    pub max_clients: usize,
    /// Interval between keepalive pings on every channel
    pub keepalive_interval: Duration,
    /// How long a destination may take to acknowledge a relayed message
    pub relay_timeout: Duration,
}

impl Default for RendezvousServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            keepalive_interval: Duration::from_secs(25),
            relay_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbound side of one peer channel.
#[derive(Clone)]
struct PeerChannel {
    conn_id: u64,
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Ack>>>>,
    next_id: Arc<AtomicU64>,
}

impl PeerChannel {
    fn new(conn_id: u64, outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            conn_id,
            outgoing,
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn reply(&self, id: Option<u64>, code: &str, message: Option<&str>) {
        if let Some(id) = id {
            let _ = self
                .outgoing
                .send(Frame::ack(id, code, message.map(str::to_string)));
        }
    }

    /// Deliver `content` and wait for the peer's acknowledgment.
    async fn deliver(&self, content: serde_json::Value, wait: Duration) -> Option<Ack> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Frame::emit(Some(id), Message::Signaling { content, to: None });
        if self.outgoing.send(frame).is_err() {
            self.pending.lock().remove(&id);
            return None;
        }
        match timeout(wait, rx).await {
            Ok(Ok(ack)) => Some(ack),
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.lock().remove(&id);
                None
            }
        }
    }
}

type Registry = Arc<RwLock<HashMap<String, PeerChannel>>>;

/// TCP rendezvous server
pub struct RendezvousServer {
    listener: TcpListener,
    registry: Registry,
    config: RendezvousServerConfig,
    next_conn_id: AtomicU64,
}

impl RendezvousServer {
    /// Bind a rendezvous server
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(bind_addr, RendezvousServerConfig::default()).await
    }

    /// Bind a rendezvous server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RendezvousServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(RwLock::new(HashMap::new())),
            config,
            next_conn_id: AtomicU64::new(0),
        })
    }

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// URL clients use to reach this server.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn url(&self) -> Result<String> {
        Ok(format!("tcp://{}", self.local_addr()?))
    }

    /// Number of registered uids.
    pub async fn client_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Accept and serve control channels until the task is dropped.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("rendezvous server listening on {}", self.listener.local_addr()?);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!("control channel {} from {}", conn_id, peer);
                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, conn_id, registry, config).await {
                            tracing::debug!("control channel {} ended: {}", conn_id, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("rendezvous accept error: {}", e),
            }
        }
    }
}

async fn serve(
    stream: TcpStream,
    conn_id: u64,
    registry: Registry,
    config: RendezvousServerConfig,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (outgoing, mut queue) = mpsc::unbounded_channel::<Frame>();
    let peer = PeerChannel::new(conn_id, outgoing);

    let keepalive = config.keepalive_interval;
    let writer_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let frame = tokio::select! {
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = ticker.tick() => Frame::emit(None, Message::Ping {}),
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("control channel write failed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(SignalingError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };
        match frame {
            Frame::Ack(ack) => {
                let waiter = peer.pending.lock().remove(&ack.id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(ack);
                }
            }
            Frame::Emit(Emit { id, message }) => {
                handle_message(&peer, id, message, &registry, &config).await;
            }
        }
    };

    // Drop every registration held by this channel
    let mut peers = registry.write().await;
    peers.retain(|uid, channel| {
        let keep = channel.conn_id != conn_id;
        if !keep {
            tracing::debug!("{} left with control channel {}", uid, conn_id);
        }
        keep
    });
    drop(peers);
    drop(peer);
    writer_task.abort();
    result
}

async fn handle_message(
    peer: &PeerChannel,
    id: Option<u64>,
    message: Message,
    registry: &Registry,
    config: &RendezvousServerConfig,
) {
    match message {
        Message::Registration { username } => {
            let mut peers = registry.write().await;
            match peers.get(&username) {
                Some(existing) if existing.conn_id != peer.conn_id => {
                    peer.reply(id, codes::CONFLICT, Some("uid already registered"));
                }
                Some(_) => peer.reply(id, ACK_OK, None),
                None if peers.len() >= config.max_clients => {
                    peer.reply(id, codes::UNAVAILABLE, Some("registration limit reached"));
                }
                None => {
                    tracing::info!("registered {}", username);
                    peers.insert(username, peer.clone());
                    peer.reply(id, ACK_OK, None);
                }
            }
        }
        Message::Deregistration { username } => {
            let mut peers = registry.write().await;
            match peers.get(&username) {
                Some(existing) if existing.conn_id == peer.conn_id => {
                    peers.remove(&username);
                    tracing::info!("deregistered {}", username);
                    peer.reply(id, ACK_OK, None);
                }
                _ => peer.reply(id, codes::NOT_FOUND, Some("uid not registered")),
            }
        }
        Message::Signaling { content, to } => {
            let Some(to) = to else {
                peer.reply(id, codes::BAD_REQUEST, Some("missing destination"));
                return;
            };
            let (sender_registered, target) = {
                let peers = registry.read().await;
                let registered = peers.values().any(|p| p.conn_id == peer.conn_id);
                (registered, peers.get(&to).cloned())
            };
            if !sender_registered {
                peer.reply(id, codes::NOT_REGISTERED, Some("sender not registered"));
                return;
            }
            let Some(target) = target else {
                peer.reply(id, codes::NOT_FOUND, Some("destination not registered"));
                return;
            };

            // Delivery may be to this very channel, so it must not block the reader
            let sender = peer.clone();
            let wait = config.relay_timeout;
            tokio::spawn(async move {
                match target.deliver(content, wait).await {
                    Some(ack) => sender.reply(id, &ack.code, ack.message.as_deref()),
                    None => {
                        tracing::debug!("relay to {} was not acknowledged", to);
                        sender.reply(id, codes::GATEWAY_TIMEOUT, Some("destination did not answer"));
                    }
                }
            });
        }
        Message::Ping {} => {}
    }
}
