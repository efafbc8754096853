//! # Tether Transport
//!
//! Transport layer for Tether.
//!
//! This crate provides:
//! - The `Transport` trait consumed by the connection manager
//! - Endpoint descriptions (`ConnectionInfo`, `ListeningInfo`)
//! - The UDP session protocol: a framed duplex stream over a shared UDP socket
//! - UDP session and TCP transport implementations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod info;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use info::{ConnectionInfo, Endpoint, ListeningInfo};
pub use tcp::{TCP_TYPE, TcpTransport, TcpTransportConfig};
pub use transport::{
    BoxedStream, Transport, TransportError, TransportEvent, TransportEventSink, TransportResult,
    TransportStats, TransportStream,
};
pub use udp::{UDP_SESSION_TYPE, UdpStream, UdpTransport, UdpTransportConfig};
