//! # Tether Net
//!
//! Connection manager for Tether.
//!
//! Ties the transports together:
//! - `Socket`: connects through an ordered list of candidate endpoints,
//!   falling back to the next one on timeout or failure
//! - `Server`: listens on every transport at once and yields accepted
//!   connections as `Socket`s regardless of origin
//! - `NetConfig`: TOML configuration and `default_transports`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod server;
pub mod socket;

#[cfg(test)]
mod mock;

pub use config::{NetConfig, default_transports};
pub use error::{AttemptFailure, FailedAttempt, NetError, Result};
pub use server::{Server, ServerEvent};
pub use socket::{Socket, SocketEvent};
