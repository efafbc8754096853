//! # Tether Signaling
//!
//! Rendezvous signaling for Tether.
//!
//! Peers that cannot reach each other directly exchange connection setup
//! messages through a rendezvous service. This crate provides:
//! - `RendezvousSignaling`: registers a uid over a persistent control
//!   channel, relays opaque messages and delivers inbound ones to a callback
//! - `RendezvousServer`: the matching relay service
//! - The length-prefixed JSON wire format both sides speak

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod wire;

pub use channel::{BoxedIo, Connector, ControlIo, MessageHandler, TcpConnector};
pub use client::{
    RegistrationInfo, RendezvousSignaling, SIGNALING_TYPE, SignalingState, generate_uid,
};
pub use config::SignalingConfig;
pub use error::{Result, SignalingError};
pub use server::{RendezvousServer, RendezvousServerConfig};
