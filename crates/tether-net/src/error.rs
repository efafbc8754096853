//! Error types for the connection manager
//!
//! Timeouts and refusals during candidate fallback are not errors on their
//! own: they are collected and surface only inside [`NetError::Exhausted`]
//! when no candidate produced a stream.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tether_transport::{ConnectionInfo, TransportError};
use thiserror::Error;

/// Why a single connection attempt did not produce a stream
#[derive(Debug)]
pub enum AttemptFailure {
    /// No stream within the transport's connect timeout
    TimedOut(Duration),
    /// The transport reported an error
    Failed(TransportError),
}

/// One candidate that was tried and failed
#[derive(Debug)]
pub struct FailedAttempt {
    /// Candidate endpoint
    pub endpoint: ConnectionInfo,
    /// What went wrong
    pub failure: AttemptFailure,
}

impl fmt::Display for FailedAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            AttemptFailure::TimedOut(after) => {
                write!(f, "{} timed out after {:?}", self.endpoint, after)
            }
            AttemptFailure::Failed(e) => write!(f, "{} failed: {}", self.endpoint, e),
        }
    }
}

fn describe(attempts: &[FailedAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidate matched a configured transport".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in connection manager operations
#[derive(Debug, Error)]
pub enum NetError {
    /// Invalid argument
    #[error("Invalid argument: {0}")]
    Validation(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    State(Cow<'static, str>),

    /// Every candidate was tried and none produced a stream
    #[error("All connection attempts failed: {}", describe(.attempts))]
    Exhausted {
        /// Attempts in the order they ran
        attempts: Vec<FailedAttempt>,
    },

    /// No stream is bound to the socket
    #[error("Socket is not connected")]
    NotConnected,

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for NetError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type for connection manager operations
pub type Result<T> = std::result::Result<T, NetError>;
