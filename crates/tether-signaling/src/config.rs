//! Signaling client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for a request to be acknowledged
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendezvous signaling client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Rendezvous service URL, `tcp://host:port`
    pub url: String,
    /// Uid to register when the caller does not request one
    pub uid: Option<String>,
    /// Delay before the single retry of a failed channel connect; no retry when unset
    pub reconnection_delay: Option<Duration>,
    /// Minimum gap between closing a channel and opening the next one
    pub reopen_delay: Duration,
    /// How long a request may wait for its acknowledgment
    pub request_timeout: Duration,
}

impl SignalingConfig {
    /// Configuration for `url` with default timing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:5000".to_string(),
            uid: None,
            reconnection_delay: None,
            reopen_delay: Duration::ZERO,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
