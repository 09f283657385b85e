//! Discovery responder and probe chain over real UDP loopback sockets.

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use lanlink_core::PeerRecord;
use lanlink_net::{discover, DiscoveryConfig, DiscoveryError, DiscoveryResponder};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

fn advert(name: &str, port: u16) -> PeerRecord {
    PeerRecord {
        name: name.to_string(),
        ip: IpAddr::from([127, 0, 0, 1]),
        port,
        version: Some("2.1".to_string()),
        discovered_at: Utc::now(),
    }
}

fn quick_config(port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        port,
        localhost_timeout: Duration::from_millis(500),
        broadcast_timeout: Duration::from_millis(300),
        scan_probe_timeout: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn test_responder_answers_probe_with_advertised_record() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = DiscoveryResponder::start(advert("udp-server", 5000), 0, shutdown_rx)
        .await
        .unwrap();
    let port = responder.local_addr().port();

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(b"DISCOVER_SERVER", ("127.0.0.1", port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (len, _) = timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("reply in time")
        .unwrap();

    let peer: PeerRecord = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(peer.name, "udp-server");
    assert_eq!(peer.port, 5000);
    assert_eq!(peer.version.as_deref(), Some("2.1"));
}

#[tokio::test]
async fn test_responder_ignores_unrelated_datagrams() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = DiscoveryResponder::start(advert("quiet-server", 5000), 0, shutdown_rx)
        .await
        .unwrap();
    let port = responder.local_addr().port();

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(b"HELLO_THERE", ("127.0.0.1", port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let reply = timeout(Duration::from_millis(500), probe.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "unrelated datagram must get no reply");

    // A real probe after the noise still works.
    probe
        .send_to(b"DISCOVER_SERVER", ("127.0.0.1", port))
        .await
        .unwrap();
    let (len, _) = timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("reply in time")
        .unwrap();
    let peer: PeerRecord = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(peer.name, "quiet-server");
}

#[tokio::test]
async fn test_discover_finds_a_localhost_responder() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = DiscoveryResponder::start(advert("nearby", 5000), 0, shutdown_rx)
        .await
        .unwrap();
    let port = responder.local_addr().port();

    let peers = discover(&quick_config(port)).await.unwrap();

    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "nearby");
}

#[tokio::test]
async fn test_discover_with_nobody_listening_reports_no_peers() {
    // Reserve a port, then free it so nothing answers there.
    let placeholder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let result = discover(&quick_config(port)).await;

    assert!(matches!(result, Err(DiscoveryError::NoPeersFound)));
}

#[tokio::test]
async fn test_responder_stops_on_shutdown_signal() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = DiscoveryResponder::start(advert("short-lived", 5000), 0, shutdown_rx)
        .await
        .unwrap();
    let port = responder.local_addr().port();

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), responder.join())
        .await
        .expect("responder stopped");

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(b"DISCOVER_SERVER", ("127.0.0.1", port))
        .await
        .unwrap();
    let mut buf = [0u8; 1024];
    let reply = timeout(Duration::from_millis(500), probe.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "stopped responder must not answer");
}
