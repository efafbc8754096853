//! Rendezvous signaling client.
//!
//! Registers a uid with a rendezvous service over a persistent control
//! channel, relays opaque messages to other registered peers and delivers
//! their messages to a callback.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─register─▶ Connecting ─▶ Registering ─"200"─▶ Registered
//!      ▲                                     │                  │   ▲
//!      └──────────── failure / close ────────┘             send │   │ ack
//!      ▲                                                        ▼   │
//!      └──── "200" ◀── Deregistering ◀── deregister ──────── Sending
//! ```

use crate::channel::{BoxedIo, Channel, Connector, MessageHandler, OnAck, TcpConnector};
use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::wire::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

/// Type tag of rendezvous registration and destination info
pub const SIGNALING_TYPE: &str = "rendezvous-signaling";

/// Identity of a peer at a rendezvous service.
///
/// Used both for the local registration and as the destination of a
/// relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Always [`SIGNALING_TYPE`] for this client
    #[serde(rename = "type")]
    pub kind: String,
    /// Registered uid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Rendezvous service URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RegistrationInfo {
    /// Registration info for `uid`, leaving the service URL to configuration.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            kind: SIGNALING_TYPE.to_string(),
            uid: Some(uid.into()),
            url: None,
        }
    }

    /// Set the rendezvous service URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    fn check_kind(&self) -> Result<()> {
        if self.kind == SIGNALING_TYPE {
            Ok(())
        } else {
            Err(SignalingError::Validation(
                format!("type {} is not {}", self.kind, SIGNALING_TYPE).into(),
            ))
        }
    }
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No control channel
    Disconnected,
    /// Opening the control channel
    Connecting,
    /// Waiting for the registration acknowledgment
    Registering,
    /// Registered; inbound messages are delivered to the callback
    Registered,
    /// Waiting for a relayed message to be acknowledged
    Sending,
    /// Waiting for the deregistration acknowledgment
    Deregistering,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::Sending => "sending",
            Self::Deregistering => "deregistering",
        };
        f.write_str(s)
    }
}

/// Signaling client bound to one rendezvous service at a time.
///
/// Each instance holds at most one control channel. A message arriving
/// before registration completes is a protocol breach: the channel stops
/// and every later operation fails with [`SignalingError::Faulted`]
/// until [`close`](Self::close) resets the instance. A channel the service
/// closes returns the instance to [`SignalingState::Disconnected`].
pub struct RendezvousSignaling {
    config: SignalingConfig,
    connector: Arc<dyn Connector>,
    channel: Option<Channel>,
    state: SignalingState,
    registration: Option<RegistrationInfo>,
    released_uid: Option<String>,
    closed_at: Option<Instant>,
}

impl RendezvousSignaling {
    /// Client that opens TCP control channels.
    #[must_use]
    pub fn new(config: SignalingConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Client that opens control channels with `connector`.
    #[must_use]
    pub fn with_connector(config: SignalingConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            channel: None,
            state: SignalingState::Disconnected,
            registration: None,
            released_uid: None,
            closed_at: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SignalingState {
        if self.remote_closed() {
            SignalingState::Disconnected
        } else {
            self.state
        }
    }

    /// Local registration, once registered.
    #[must_use]
    pub fn registration(&self) -> Option<&RegistrationInfo> {
        if self.remote_closed() {
            return None;
        }
        self.registration.as_ref()
    }

    /// Whether a control channel is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_some() && !self.remote_closed()
    }

    /// Reason the control channel was torn down by a hard failure, if it was.
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        self.channel.as_ref().and_then(Channel::fault)
    }

    /// Open a control channel and register a uid.
    ///
    /// The uid comes from `requested`, then configuration, and is generated
    /// otherwise. `on_message` receives every inbound payload once the
    /// service has acknowledged the registration. A rejected or timed out
    /// registration closes the channel so the instance can try again.
    pub async fn register<F>(
        &mut self,
        on_message: F,
        requested: Option<RegistrationInfo>,
    ) -> Result<RegistrationInfo>
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        self.check_fault()?;
        self.reap_closed();
        if self.channel.is_some() {
            return Err(SignalingError::State(
                "only one rendezvous connection allowed per instance".into(),
            ));
        }
        if let Some(requested) = &requested {
            requested.check_kind()?;
        }

        let (uid, url) = match requested {
            Some(RegistrationInfo { uid, url, .. }) => (uid, url),
            None => (None, None),
        };
        let uid = uid
            .or_else(|| self.config.uid.clone())
            .unwrap_or_else(generate_uid);
        let url = url.unwrap_or_else(|| self.config.url.clone());

        self.wait_reopen_delay().await;
        self.state = SignalingState::Connecting;
        let io = match self.open_io(&url).await {
            Ok(io) => io,
            Err(e) => {
                self.state = SignalingState::Disconnected;
                return Err(e);
            }
        };
        self.channel = Some(Channel::open(io));

        self.state = SignalingState::Registering;
        let handler: MessageHandler = Arc::new(on_message);
        let result = self
            .request(
                Message::Registration {
                    username: uid.clone(),
                },
                OnAck::Install(handler),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("registration of {} at {} failed: {}", uid, url, e);
            if matches!(e, SignalingError::Faulted(_)) {
                // A faulted channel is held until close()
                self.state = SignalingState::Disconnected;
            } else {
                self.teardown();
            }
            return Err(e);
        }

        let info = RegistrationInfo::new(uid).with_url(url);
        tracing::info!(
            "registered {} at {}",
            info.uid.as_deref().unwrap_or_default(),
            info.url.as_deref().unwrap_or_default()
        );
        self.registration = Some(info.clone());
        self.released_uid = None;
        self.state = SignalingState::Registered;
        Ok(info)
    }

    /// Release the local registration and close the channel.
    ///
    /// Releasing the uid that was just released succeeds without contacting
    /// the service.
    pub async fn deregister(&mut self, info: &RegistrationInfo) -> Result<()> {
        self.check_fault()?;
        info.check_kind()?;
        let Some(uid) = info.uid.as_deref() else {
            return Err(SignalingError::Validation("missing uid".into()));
        };
        if self.reap_closed() {
            return Err(SignalingError::ChannelClosed);
        }

        if self.registration.is_none() && self.released_uid.as_deref() == Some(uid) {
            tracing::debug!("{} already deregistered", uid);
            return Ok(());
        }
        let registered = self
            .registration
            .as_ref()
            .and_then(|r| r.uid.as_deref());
        if registered != Some(uid) {
            return Err(SignalingError::State(
                format!("{uid} is not registered on this instance").into(),
            ));
        }

        let uid = uid.to_string();
        self.state = SignalingState::Deregistering;
        let result = self
            .request(
                Message::Deregistration {
                    username: uid.clone(),
                },
                OnAck::Clear,
            )
            .await;
        if let Err(e) = result {
            self.state = SignalingState::Registered;
            return Err(e);
        }

        tracing::info!("deregistered {}", uid);
        self.teardown();
        self.released_uid = Some(uid);
        Ok(())
    }

    /// Relay `message` to the peer registered as `destination`.
    ///
    /// Succeeds once the service acknowledges delivery.
    pub async fn send(
        &mut self,
        message: serde_json::Value,
        destination: &RegistrationInfo,
    ) -> Result<()> {
        self.check_fault()?;
        if self.reap_closed() {
            return Err(SignalingError::ChannelClosed);
        }
        if self.registration.is_none() || self.channel.is_none() {
            return Err(SignalingError::State("not registered".into()));
        }
        destination.check_kind()?;
        let Some(to) = destination.uid.clone() else {
            return Err(SignalingError::Validation("missing destination uid".into()));
        };

        self.state = SignalingState::Sending;
        let result = self
            .request(
                Message::Signaling {
                    content: message,
                    to: Some(to),
                },
                OnAck::Nothing,
            )
            .await;
        if self.channel.is_some() {
            self.state = SignalingState::Registered;
        }
        result
    }

    /// Close the control channel without deregistering.
    ///
    /// Always succeeds, also when no channel is open or it already faulted.
    pub async fn close(&mut self) -> Result<()> {
        if self.channel.is_some() {
            tracing::debug!("closing rendezvous channel");
            self.teardown();
        }
        self.released_uid = None;
        Ok(())
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault() {
            Some(reason) => Err(SignalingError::Faulted(reason)),
            None => Ok(()),
        }
    }

    fn remote_closed(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_closed)
    }

    /// Drop a channel the service closed. Returns whether one was dropped.
    fn reap_closed(&mut self) -> bool {
        if !self.remote_closed() {
            return false;
        }
        tracing::info!("rendezvous service closed the channel");
        self.teardown();
        true
    }

    async fn open_io(&self, url: &str) -> Result<BoxedIo> {
        match self.connector.connect(url).await {
            Ok(io) => Ok(io),
            Err(e) if e.is_local() => Err(e),
            Err(e) => {
                let Some(delay) = self.config.reconnection_delay else {
                    return Err(e);
                };
                tracing::debug!("connect to {} failed ({}), retrying in {:?}", url, e, delay);
                tokio::time::sleep(delay).await;
                self.connector.connect(url).await
            }
        }
    }

    async fn wait_reopen_delay(&self) {
        let Some(closed_at) = self.closed_at else {
            return;
        };
        let remaining = self.config.reopen_delay.saturating_sub(closed_at.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }

    async fn request(&mut self, message: Message, on_ack: OnAck) -> Result<()> {
        let request_timeout = self.config.request_timeout;
        let channel = self.channel.as_mut().ok_or(SignalingError::ChannelClosed)?;
        let event = message.event_name();
        let (id, ack) = channel.request(message, on_ack)?;
        tracing::trace!("request {} ({}) sent", id, event);

        let ack = match timeout(request_timeout, ack).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(channel.dropped_error()),
            Err(_) => {
                channel.forget(id);
                return Err(SignalingError::Timeout(request_timeout));
            }
        };
        if ack.is_ok() {
            Ok(())
        } else {
            Err(SignalingError::Protocol {
                code: ack.code,
                message: ack.message,
            })
        }
    }

    fn teardown(&mut self) {
        self.channel = None;
        self.registration = None;
        self.state = SignalingState::Disconnected;
        self.closed_at = Some(Instant::now());
    }
}

impl fmt::Debug for RendezvousSignaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousSignaling")
            .field("url", &self.config.url)
            .field("state", &self.state)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

/// Random 128-bit uid in hex.
#[must_use]
pub fn generate_uid() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
