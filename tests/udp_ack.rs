//! End-to-end UDP sessions with and without the acknowledgement protocol.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{receive_config, send_config};
use peerlink::{Session, TransportSpec};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn datagram_session_delivers_payloads() {
    let mut server = Session::new(receive_config(TransportSpec::udp_receive()));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = Session::new(send_config(TransportSpec::udp_send(), port));
    client.start().await.unwrap();

    assert!(client.enqueue(b"datagram one".to_vec()));
    assert!(client.enqueue(b"datagram two".to_vec()));

    let first = server.dequeue_wait(Duration::from_secs(2)).await.unwrap();
    let second = server.dequeue_wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(first, b"datagram one".to_vec());
    assert_eq!(second, b"datagram two".to_vec());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn acknowledged_sends_complete_against_an_acking_receiver() {
    let mut server = Session::new(receive_config(TransportSpec::udp_receive_with_ack()));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = Session::new(send_config(TransportSpec::udp_send_with_ack(), port));
    client.start().await.unwrap();

    assert!(client.enqueue(b"needs ack".to_vec()));

    let delivered = server.dequeue_wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(delivered, b"needs ack".to_vec());

    // Give the ack a moment to land, then confirm no timeout was recorded
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        client.metrics().ack_timeouts.load(Ordering::Relaxed),
        0,
        "acks flowed, no timeout expected"
    );
    assert_eq!(
        client.metrics().messages_sent.load(Ordering::Relaxed),
        1
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn silent_peer_surfaces_ack_timeouts() {
    // Bind a socket that never answers, so the port is real but mute
    let mute = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = mute.local_addr().unwrap().port();

    let mut config = send_config(TransportSpec::udp_send_with_ack(), port);
    config.timeouts.udp_send_ack_timeout_ms = 100;
    config.timeouts.sender_interval_ms = 5;
    let mut client = Session::new(config);
    client.start().await.unwrap();

    assert!(client.enqueue(b"shouting into the void".to_vec()));

    // The loop must report the loss: counted, not silently forgotten
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        client.metrics().ack_timeouts.load(Ordering::Relaxed) >= 1,
        "missed ack must be recorded"
    );
    assert_eq!(client.metrics().messages_sent.load(Ordering::Relaxed), 0);

    client.stop().await;
}

#[tokio::test]
async fn udp_probe_roundtrips_through_a_receive_session() {
    let mut server = Session::new(receive_config(TransportSpec::udp_receive()));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Session::new(send_config(TransportSpec::udp_send(), port));
    let rtt = client.probe(Duration::from_secs(2)).await.unwrap();
    assert!(rtt <= Duration::from_secs(2));

    server.stop().await;
}
