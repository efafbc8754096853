//! Error types for the signaling protocol
//!
//! Local problems (bad arguments, wrong state) are reported before anything
//! is sent. Remote problems carry the acknowledgment code the rendezvous
//! service replied with.

use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the signaling client and rendezvous server
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Malformed or missing registration/destination fields
    #[error("Invalid request: {0}")]
    Validation(Cow<'static, str>),

    /// Operation not valid in the current channel state
    #[error("Invalid state: {0}")]
    State(Cow<'static, str>),

    /// Rendezvous service answered with a non-success code
    #[error("Rendezvous service replied {code}: {}", message.as_deref().unwrap_or("no reason given"))]
    Protocol {
        /// Acknowledgment code
        code: String,
        /// Reason supplied by the service
        message: Option<String>,
    },

    /// No acknowledgment within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Control channel closed while the request was outstanding
    #[error("Rendezvous channel closed")]
    ChannelClosed,

    /// Message the service must not send in the current state
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(Cow<'static, str>),

    /// Channel was torn down by an earlier hard failure
    #[error("Rendezvous channel faulted: {0}")]
    Faulted(String),

    /// Frame exceeds the maximum frame size
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SignalingError {
    /// Whether this error was detected locally, before any request was sent.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::State(_))
    }
}

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SignalingError>;
