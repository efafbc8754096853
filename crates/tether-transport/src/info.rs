//! Endpoint descriptions exchanged between peers.
//!
//! A [`ConnectionInfo`] names one connection candidate: the transport type tag
//! plus whatever that transport needs to reach the peer. The JSON form is flat
//! and camelCase so it can be passed through the signaling channel verbatim:
//!
//! ```text
//! {"transportType":"udp-session","address":"10.0.0.7","port":40000}
//! {"transportType":"turn-relay","uid":"9f2c…","url":"tcp://rendezvous:5000"}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One connection endpoint candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Transport type tag, matched against `Transport::transport_type()`
    pub transport_type: String,
    /// Transport-specific addressing
    #[serde(flatten)]
    pub endpoint: Endpoint,
}

/// Description of an address a transport is bound to.
///
/// Same shape as [`ConnectionInfo`]; a listening descriptor is what a peer
/// later uses as its connection candidate.
pub type ListeningInfo = ConnectionInfo;

/// Transport-specific part of a [`ConnectionInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    /// Directly routable socket address (UDP, TCP)
    Socket {
        /// IP address
        address: IpAddr,
        /// Port number
        port: u16,
    },
    /// Peer reachable through a rendezvous service (relayed transports)
    Rendezvous {
        /// Peer identity at the rendezvous service
        uid: String,
        /// Rendezvous service URL
        url: String,
    },
}

impl ConnectionInfo {
    /// Create a socket-address endpoint for the given transport type.
    #[must_use]
    pub fn socket(transport_type: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            transport_type: transport_type.into(),
            endpoint: Endpoint::Socket {
                address: addr.ip(),
                port: addr.port(),
            },
        }
    }

    /// Create a rendezvous endpoint for the given transport type.
    #[must_use]
    pub fn rendezvous(
        transport_type: impl Into<String>,
        uid: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            transport_type: transport_type.into(),
            endpoint: Endpoint::Rendezvous {
                uid: uid.into(),
                url: url.into(),
            },
        }
    }

    /// Socket address of this endpoint, if it has one.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.endpoint {
            Endpoint::Socket { address, port } => Some(SocketAddr::new(address, port)),
            Endpoint::Rendezvous { .. } => None,
        }
    }

    /// Whether this candidate targets the given transport type.
    #[must_use]
    pub fn is_for(&self, transport_type: &str) -> bool {
        self.transport_type == transport_type
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Socket { address, port } => write!(
                f,
                "{}://{}",
                self.transport_type,
                SocketAddr::new(*address, *port)
            ),
            Endpoint::Rendezvous { uid, url } => {
                write!(f, "{}://{}@{}", self.transport_type, uid, url)
            }
        }
    }
}
