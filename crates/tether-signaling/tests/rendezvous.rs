//! Two signaling clients exchanging messages through a rendezvous server

use std::sync::Arc;
use std::time::Duration;
use tether_signaling::{
    RegistrationInfo, RendezvousServer, RendezvousSignaling, SignalingConfig, SignalingError,
    SignalingState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn start_server() -> String {
    let server = Arc::new(
        RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let url = server.url().unwrap();
    tokio::spawn(async move { server.run().await });
    url
}

async fn join(
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
async fn test_relay_between_peers() {
    let url = start_server().await;
    let (mut alice, _alice_inbox) = join(&url, "alice").await;
    let (_bob, mut bob_inbox) = join(&url, "bob").await;

    let offer = serde_json::json!({"type": "offer", "sdp": "v=0"});
    alice
        .send(offer.clone(), &RegistrationInfo::new("bob"))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(1), bob_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, offer);
}

#[tokio::test]
async fn test_send_to_unknown_peer() {
    let url = start_server().await;
    let (mut alice, _inbox) = join(&url, "alice").await;
    let err = alice
        .send(serde_json::json!(1), &RegistrationInfo::new("nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::Protocol { ref code, .. } if code == "404"));
    assert_eq!(alice.state(), SignalingState::Registered);
}

#[tokio::test]
async fn test_uid_taken_then_released() {
    let url = start_server().await;
    let (mut alice, _inbox) = join(&url, "alice").await;

    let mut impostor = RendezvousSignaling::new(SignalingConfig::new(url.as_str()));
    let err = impostor
        .register(|_| {}, Some(RegistrationInfo::new("alice")))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::Protocol { ref code, .. } if code == "409"));
    assert!(!impostor.is_open());

    let info = alice.registration().cloned().unwrap();
    alice.deregister(&info).await.unwrap();
    alice.deregister(&info).await.unwrap();

    impostor
        .register(|_| {}, Some(RegistrationInfo::new("alice")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_service() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let mut signaling =
        RendezvousSignaling::new(SignalingConfig::new(format!("tcp://127.0.0.1:{port}")));
    let err = signaling.register(|_| {}, None).await.unwrap_err();
    assert!(matches!(err, SignalingError::Io(_)));
    assert_eq!(signaling.state(), SignalingState::Disconnected);
}
