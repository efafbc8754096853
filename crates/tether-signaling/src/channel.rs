//! Persistent control channel to the rendezvous service.
//!
//! A channel is opened by a [`Connector`] and then driven by two tasks: a
//! writer draining an outgoing frame queue, and a reader that resolves
//! pending acknowledgments and dispatches inbound signaling messages.

use crate::error::{Result, SignalingError};
use crate::wire::{ACK_OK, Ack, Emit, Frame, Message, read_frame, write_frame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Byte stream carrying a control channel.
pub trait ControlIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlIo for T {}

/// Boxed control channel stream
pub type BoxedIo = Box<dyn ControlIo>;

/// Callback receiving inbound signaling payloads
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Opens control channels to a rendezvous service URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh channel to `url`.
    async fn connect(&self, url: &str) -> Result<BoxedIo>;
}

/// Connector for `tcp://host:port` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str) -> Result<BoxedIo> {
        let parsed = url::Url::parse(url)
            .map_err(|e| SignalingError::Validation(format!("invalid url {url}: {e}").into()))?;
        if parsed.scheme() != "tcp" {
            return Err(SignalingError::Validation(
                format!("unsupported scheme {}", parsed.scheme()).into(),
            ));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| SignalingError::Validation(format!("{url} has no host").into()))?;
        let port = parsed
            .port()
            .ok_or_else(|| SignalingError::Validation(format!("{url} has no port").into()))?;

        // IPv6 literals come back bracketed from the url crate
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("control channel connected to {}", url);
        Ok(Box::new(stream))
    }
}

/// What the reader does when a request is acknowledged with success.
pub(crate) enum OnAck {
    Nothing,
    /// Start dispatching inbound messages to this handler
    Install(MessageHandler),
    /// Stop dispatching inbound messages
    Clear,
}

struct PendingRequest {
    reply: oneshot::Sender<Ack>,
    on_ack: OnAck,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ChannelStatus {
    #[default]
    Open,
    Closed,
    Faulted(String),
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handler: Mutex<Option<MessageHandler>>,
    status: Mutex<ChannelStatus>,
}

impl Shared {
    fn status(&self) -> ChannelStatus {
        self.status.lock().clone()
    }
}

/// An open control channel.
pub(crate) struct Channel {
    outgoing: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    next_id: u64,
}

impl Channel {
    /// Spawn the driver tasks over `io`.
    pub(crate) fn open(io: BoxedIo) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (outgoing, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        tokio::spawn(write_loop(write_half, queue));
        let reader = tokio::spawn(read_loop(read_half, outgoing.clone(), shared.clone()));

        Self {
            outgoing,
            shared,
            reader,
            next_id: 0,
        }
    }

    /// Fails if the channel was closed by the remote or torn down by a fault.
    pub(crate) fn check(&self) -> Result<()> {
        match self.shared.status() {
            ChannelStatus::Open => Ok(()),
            ChannelStatus::Closed => Err(SignalingError::ChannelClosed),
            ChannelStatus::Faulted(reason) => Err(SignalingError::Faulted(reason)),
        }
    }

    /// Whether the remote closed the channel without a fault.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.status() == ChannelStatus::Closed
    }

    /// Reason of the hard failure that tore the channel down, if any.
    pub(crate) fn fault(&self) -> Option<String> {
        match self.shared.status() {
            ChannelStatus::Faulted(reason) => Some(reason),
            _ => None,
        }
    }

    /// Queue `message` as a request and return its id and acknowledgment.
    pub(crate) fn request(
        &mut self,
        message: Message,
        on_ack: OnAck,
    ) -> Result<(u64, oneshot::Receiver<Ack>)> {
        self.check()?;
        self.next_id += 1;
        let id = self.next_id;
        let (reply, ack) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(id, PendingRequest { reply, on_ack });

        if self.outgoing.send(Frame::emit(Some(id), message)).is_err() {
            self.forget(id);
            return Err(SignalingError::ChannelClosed);
        }
        Ok((id, ack))
    }

    /// Drop a pending request that will no longer be awaited.
    pub(crate) fn forget(&self, id: u64) {
        self.shared.pending.lock().remove(&id);
    }

    /// Error to report for a request whose acknowledgment was dropped.
    pub(crate) fn dropped_error(&self) -> SignalingError {
        match self.check() {
            Err(e) => e,
            Ok(()) => SignalingError::ChannelClosed,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The writer exits once the queue sender is gone and shuts the
        // stream down after flushing whatever was already queued.
        self.reader.abort();
        self.shared.pending.lock().clear();
        self.shared.handler.lock().take();
    }
}

async fn write_loop(mut writer: WriteHalf<BoxedIo>, mut queue: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::warn!("control channel write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: ReadHalf<BoxedIo>,
    outgoing: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
) {
    let outcome = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(SignalingError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };

        match frame {
            Frame::Ack(ack) => on_ack(&shared, ack),
            Frame::Emit(Emit { id, message }) => match message {
                Message::Signaling { content, .. } => {
                    let handler = shared.handler.lock().clone();
                    let Some(handler) = handler else {
                        break Err(SignalingError::UnexpectedMessage(
                            "signaling message with no registered callback".into(),
                        ));
                    };
                    handler(content);
                    if let Some(id) = id {
                        let _ = outgoing.send(Frame::ack(id, ACK_OK, None));
                    }
                }
                Message::Ping {} => tracing::debug!("incoming ping"),
                other => {
                    tracing::warn!(
                        "ignoring {} event from rendezvous service",
                        other.event_name()
                    );
                    if let Some(id) = id {
                        let _ = outgoing.send(Frame::ack(
                            id,
                            "400",
                            Some("unsupported event".to_string()),
                        ));
                    }
                }
            },
        }
    };

    let status = match outcome {
        Ok(()) => {
            tracing::debug!("control channel closed by remote");
            ChannelStatus::Closed
        }
        Err(e) => {
            tracing::error!("control channel failed: {}", e);
            ChannelStatus::Faulted(e.to_string())
        }
    };
    *shared.status.lock() = status;
    // Dropping the reply senders wakes every waiter
    shared.pending.lock().clear();
    shared.handler.lock().take();
}

fn on_ack(shared: &Shared, ack: Ack) {
    let Some(request) = shared.pending.lock().remove(&ack.id) else {
        tracing::debug!("acknowledgment for unknown request {}", ack.id);
        return;
    };
    if ack.is_ok() {
        match request.on_ack {
            OnAck::Nothing => {}
            OnAck::Install(handler) => *shared.handler.lock() = Some(handler),
            OnAck::Clear => {
                shared.handler.lock().take();
            }
        }
    }
    let _ = request.reply.send(ack);
}
