//! End-to-end tests: signaling-assisted connection setup over loopback
//!
//! The listening peer publishes its addresses through the rendezvous
//! server; the dialing peer receives them as candidates and connects with
//! fallback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_integration_tests::{
    TimingValidator, ci_timeout, init_tracing, loopback_config, start_rendezvous,
};
use tether_net::{Server, Socket, default_transports};
use tether_signaling::{RegistrationInfo, RendezvousSignaling, SignalingConfig};
use tether_transport::{
    BoxedStream, ConnectionInfo, ListeningInfo, TCP_TYPE, Transport, TransportError,
    TransportEventSink, TransportResult, UDP_SESSION_TYPE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn signaling_peer(
    url: &str,
    uid: &str,
) -> (RendezvousSignaling, mpsc::UnboundedReceiver<serde_json::Value>) {
    let mut signaling = RendezvousSignaling::new(SignalingConfig::new(url));
    let (tx, rx) = mpsc::unbounded_channel();
    signaling
        .register(
            move |value| {
                let _ = tx.send(value);
            },
            Some(RegistrationInfo::new(uid)),
        )
        .await
        .unwrap();
    (signaling, rx)
}

#[tokio::test]
async fn test_connect_with_signaled_candidates() {
    init_tracing();
    let url = start_rendezvous().await.unwrap();

    let mut server = Server::new(default_transports(&loopback_config()).unwrap());
    let addresses = server.listen(&[]).await.unwrap().to_vec();
    assert_eq!(addresses.len(), 2);

    let (mut listener_peer, _) = signaling_peer(&url, "listener").await;
    let (mut dialer_peer, mut dialer_inbox) = signaling_peer(&url, "dialer").await;

    listener_peer
        .send(
            serde_json::to_value(&addresses).unwrap(),
            &RegistrationInfo::new("dialer"),
        )
        .await
        .unwrap();
    let received = timeout(ci_timeout(Duration::from_secs(1)), dialer_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    let candidates: Vec<ConnectionInfo> = serde_json::from_value(received).unwrap();
    assert_eq!(candidates, addresses);

    let mut client = Socket::new(default_transports(&loopback_config()).unwrap());
    client.connect(&candidates).await.unwrap();
    assert!(client.remote_address().unwrap().is_for(UDP_SESSION_TYPE));

    let mut accepted = server.accept().await.unwrap();
    client.write_all(b"through the rendezvous").await.unwrap();
    let mut buf = vec![0u8; 22];
    timeout(ci_timeout(Duration::from_secs(1)), accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, b"through the rendezvous");

    client.destroy().await.unwrap();
    server.close();
    for peer in [&mut listener_peer, &mut dialer_peer] {
        let info = peer.registration().cloned().unwrap();
        peer.deregister(&info).await.unwrap();
        peer.deregister(&info).await.unwrap();
        peer.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_fallback_to_tcp_when_udp_unanswered() {
    init_tracing();
    let mut server = Server::new(default_transports(&loopback_config()).unwrap());
    let addresses = server.listen(&[]).await.unwrap().to_vec();
    let tcp = addresses.iter().find(|a| a.is_for(TCP_TYPE)).cloned().unwrap();

    // Nothing answers SYN on a port that was bound and released
    let silent_port = {
        let spare = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let silent = ConnectionInfo::socket(
        UDP_SESSION_TYPE,
        SocketAddr::from(([127, 0, 0, 1], silent_port)),
    );

    let mut config = loopback_config();
    config.udp.connect_timeout_ms = 100;
    let mut client = Socket::new(default_transports(&config).unwrap());
    client.connect(&[silent, tcp.clone()]).await.unwrap();
    assert_eq!(client.remote_address(), Some(&tcp));

    let accepted = timeout(ci_timeout(Duration::from_secs(1)), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(accepted.remote_address().unwrap().is_for(TCP_TYPE));
}

/// Transport whose connect never completes
struct Blackhole;

#[async_trait::async_trait]
impl Transport for Blackhole {
    fn transport_type(&self) -> &str {
        "blackhole"
    }

    async fn listen(
        &self,
        _info: Option<ListeningInfo>,
        _events: TransportEventSink,
    ) -> TransportResult<Vec<ListeningInfo>> {
        Err(TransportError::Other("blackhole cannot listen".to_string()))
    }

    async fn connect(&self, _endpoint: &ConnectionInfo) -> TransportResult<BoxedStream> {
        std::future::pending().await
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn block_incoming(&self) {}

    fn unlisten(&self) {}
}

#[tokio::test]
async fn test_hanging_transport_fallback_timing() {
    init_tracing();
    let mut server = Server::new(default_transports(&loopback_config()).unwrap());
    let addresses = server.listen(&[]).await.unwrap().to_vec();
    let tcp = addresses.iter().find(|a| a.is_for(TCP_TYPE)).cloned().unwrap();
    let hole = ConnectionInfo::socket("blackhole", "127.0.0.1:9".parse().unwrap());

    let mut validator = TimingValidator::new(3);
    for _ in 0..3 {
        let mut transports = default_transports(&loopback_config()).unwrap();
        transports.insert(0, Arc::new(Blackhole));
        let mut client = Socket::new(transports);

        let start = Instant::now();
        client.connect(&[hole.clone(), tcp.clone()]).await.unwrap();
        validator.add_sample(start.elapsed());

        let _accepted = server.accept().await.unwrap();
    }
    validator.assert_between(Duration::from_millis(100), Duration::from_millis(130));
}
