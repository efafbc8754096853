//! UDP session protocol.
//!
//! A minimal framed duplex stream run directly over a shared UDP socket and
//! multiplexed by session id. Packets follow a small state machine:
//!
//! ```text
//!   initiator                      responder
//!       │ ── SYN ──────────────────────▶ │   session created, `Connection` event
//!       │ ◀──────────────────── SYN_ACK ─ │
//!       │ ◀─── DATA ───▶ ... ◀─── DATA ──▶ │
//!       │ ── FIN ──────────────────────▶ │   write side half-closed
//!       │ ── RST ──────────────────────▶ │   session torn down
//! ```
//!
//! Delivery is best-effort: nothing is acknowledged or retransmitted.

pub mod packet;
pub mod stream;
pub mod transport;

pub use packet::{Packet, PacketError, PacketType};
pub use stream::{SESSION_QUEUE_DEPTH, SessionInbox, SessionState, UdpStream};
pub use transport::{UdpTransport, UdpTransportConfig};

/// Transport type tag of the UDP session transport
pub const UDP_SESSION_TYPE: &str = "udp-session";

/// Protocol version stamped on packets by default
pub const DEFAULT_VERSION: &str = "1";
