//! Listening side of the connection manager.
//!
//! A [`Server`] binds every configured transport at once and merges their
//! accepted streams into one sequence of [`Socket`]s, whatever transport
//! they arrived on.

use crate::error::{NetError, Result};
use crate::socket::Socket;
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use tether_transport::{ListeningInfo, Transport, TransportError, TransportEvent};
use tokio::sync::mpsc;

/// Event yielded by a listening [`Server`]
#[derive(Debug)]
pub enum ServerEvent {
    /// A peer connected on one of the transports
    Connection(Socket),
    /// A transport reported a failure
    Error(TransportError),
}

/// Multi-transport listener.
pub struct Server {
    transports: Vec<Arc<dyn Transport>>,
    addresses: Vec<ListeningInfo>,
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    listening: bool,
}

impl Server {
    /// Server listening through `transports` once [`listen`](Self::listen) is called.
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        Self {
            transports,
            addresses: Vec::new(),
            sink: Some(sink),
            events,
            listening: false,
        }
    }

    /// Bind all transports concurrently.
    ///
    /// Each transport gets the entry of `listening_info` matching its type,
    /// or `None` to use its configured default. The call fails if any
    /// transport fails to bind, and the transports that did bind are
    /// released again before it returns.
    ///
    /// # Errors
    ///
    /// `Validation` without transports, `State` if already listening or
    /// closed, `Transport` when a bind fails.
    pub async fn listen(&mut self, listening_info: &[ListeningInfo]) -> Result<&[ListeningInfo]> {
        if self.transports.is_empty() {
            return Err(NetError::Validation("no transports configured".into()));
        }
        if self.listening {
            return Err(NetError::State("server is already listening".into()));
        }
        let Some(sink) = self.sink.clone() else {
            return Err(NetError::State("server is closed".into()));
        };

        let binds = self.transports.iter().map(|transport| {
            let info = listening_info
                .iter()
                .find(|info| info.is_for(transport.transport_type()))
                .cloned();
            let sink = sink.clone();
            async move { transport.listen(info, sink).await }
        });
        let results = join_all(binds).await;

        let mut bound = Vec::new();
        let mut failure = None;
        for (transport, result) in self.transports.iter().zip(results) {
            match result {
                Ok(infos) => bound.push((transport, infos)),
                Err(e) => {
                    tracing::warn!("{} failed to listen: {}", transport.transport_type(), e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            for (transport, _) in &bound {
                transport.unlisten();
            }
            return Err(e.into());
        }

        self.addresses = bound.into_iter().flat_map(|(_, infos)| infos).collect();
        self.listening = true;
        for address in &self.addresses {
            tracing::info!("listening on {}", address);
        }
        Ok(&self.addresses)
    }

    /// Addresses all transports are reachable on.
    #[must_use]
    pub fn address(&self) -> &[ListeningInfo] {
        &self.addresses
    }

    /// Whether `listen` succeeded.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Next connection or transport error.
    ///
    /// Returns `None` only once every transport has dropped the sink it got
    /// from `listen`. A closed server keeps its transports bound, so this
    /// waits for errors or for connections already in flight.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        let event = self.events.recv().await?;
        Some(match event {
            TransportEvent::Connection {
                stream,
                transport_type,
                peer,
            } => {
                tracing::debug!(transport = %transport_type, "incoming connection from {}", peer);
                ServerEvent::Connection(Socket::accepted(self.transports.clone(), stream, peer))
            }
            TransportEvent::Error(e) => ServerEvent::Error(e),
        })
    }

    /// Next connection, logging and skipping transport errors.
    pub async fn accept(&mut self) -> Option<Socket> {
        loop {
            match self.next_event().await? {
                ServerEvent::Connection(socket) => return Some(socket),
                ServerEvent::Error(e) => tracing::warn!("transport error while listening: {}", e),
            }
        }
    }

    /// Stop accepting new connections on every transport.
    ///
    /// Sockets already handed out keep working. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.sink.take().is_none() {
            return;
        }
        for transport in &self.transports {
            transport.block_incoming();
        }
        self.listening = false;
        tracing::debug!("server closed");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("transports", &self.transports.len())
            .field("addresses", &self.addresses)
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}
