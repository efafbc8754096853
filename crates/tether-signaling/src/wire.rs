//! Control channel wire format.
//!
//! Every frame is a JSON document behind a length prefix:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┐
//! │ Length (4 bytes)│ JSON frame (N bytes) │
//! │  big-endian u32 │                      │
//! └─────────────────┴──────────────────────┘
//! ```
//!
//! A frame is either an `emit` carrying one named event, or the `ack` that
//! answers an earlier emit with the same id:
//!
//! ```json
//! {"kind":"emit","id":3,"event":"registration","data":{"username":"a1b2"}}
//! {"kind":"ack","id":3,"code":"200","message":null}
//! ```

use crate::error::{Result, SignalingError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MiB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Acknowledgment code for success
pub const ACK_OK: &str = "200";

/// Event carried by an `emit` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Message {
    /// Register a uid with the rendezvous service
    Registration {
        /// Uid to register
        username: String,
    },
    /// Release a previously registered uid
    Deregistration {
        /// Uid to release
        username: String,
    },
    /// Opaque payload relayed between peers
    Signaling {
        /// Payload, forwarded untouched
        content: serde_json::Value,
        /// Destination uid (set on the way in, absent on delivery)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Keepalive from the rendezvous service
    Ping {},
}

impl Message {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Deregistration { .. } => "deregistration",
            Self::Signaling { .. } => "signaling",
            Self::Ping {} => "ping",
        }
    }
}

/// Event emission, optionally expecting an acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emit {
    /// Request id; absent for fire-and-forget events such as pings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The event
    #[serde(flatten)]
    pub message: Message,
}

/// Acknowledgment for an emit with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the acknowledged emit
    pub id: u64,
    /// Status code, `"200"` on success
    pub code: String,
    /// Optional reason
    #[serde(default)]
    pub message: Option<String>,
}

impl Ack {
    /// Whether the acknowledgment reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == ACK_OK
    }
}

/// A control channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Event emission
    Emit(Emit),
    /// Acknowledgment
    Ack(Ack),
}

impl Frame {
    /// Emit `message` under request id `id`.
    #[must_use]
    pub fn emit(id: Option<u64>, message: Message) -> Self {
        Self::Emit(Emit { id, message })
    }

    /// Acknowledge request `id` with `code`.
    pub fn ack(id: u64, code: impl Into<String>, message: Option<String>) -> Self {
        Self::Ack(Ack {
            id,
            code: code.into(),
            message,
        })
    }
}

/// Read one length-prefixed frame.
///
/// A clean end of stream before the length prefix surfaces as an
/// `UnexpectedEof` I/O error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(SignalingError::FrameTooLarge(len as usize));
    }
    if len == 0 {
        return Err(SignalingError::UnexpectedMessage("empty frame".into()));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(SignalingError::FrameTooLarge(body.len()));
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
