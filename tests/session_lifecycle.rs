//! Integration tests for session configuration validation and lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{receive_config, send_config};
use peerlink::transport::LoopState;
use peerlink::{
    Cardinality, CommError, CommunicationConfig, Endpoint, Session, TransportSpec,
};
use std::sync::Arc;
use std::time::Duration;

fn config_for(
    cardinality: Cardinality,
    socket_count: usize,
    box_lengths: Vec<usize>,
) -> CommunicationConfig {
    CommunicationConfig::new(
        TransportSpec::tcp_receive(),
        cardinality,
        vec![Endpoint::new("127.0.0.1", 19321)],
    )
    .with_overrides(|c| {
        c.local_bind = Some(Endpoint::new("127.0.0.1", 0));
        c.socket_count = socket_count;
        c.box_lengths = box_lengths;
    })
}

#[tokio::test]
async fn matching_topologies_start() {
    let cases = vec![
        config_for(Cardinality::Equal, 1, vec![16]),
        config_for(Cardinality::EqualBidirectional, 2, vec![16, 16]),
        config_for(Cardinality::ManyMessageBoxesToOneSocket, 1, vec![16, 16, 16]),
    ];

    for config in cases {
        let label = format!("{:?}", config.cardinality);
        let mut session = Session::new(config);
        session
            .start()
            .await
            .unwrap_or_else(|e| panic!("{label} should start: {e}"));
        session.stop().await;
    }
}

#[tokio::test]
async fn mismatched_topologies_raise_config_errors() {
    let cases = vec![
        // Equal wants one box per socket
        config_for(Cardinality::Equal, 1, vec![16, 16]),
        config_for(Cardinality::Equal, 2, vec![16]),
        // Bidirectional wants exactly two boxes and two sockets
        config_for(Cardinality::EqualBidirectional, 2, vec![16]),
        config_for(Cardinality::EqualBidirectional, 1, vec![16, 16]),
        // Many-to-one wants exactly one socket
        config_for(Cardinality::ManyMessageBoxesToOneSocket, 2, vec![16, 16]),
    ];

    for config in cases {
        let label = format!(
            "{:?}/sockets={}/boxes={}",
            config.cardinality,
            config.socket_count,
            config.box_lengths.len()
        );
        let mut session = Session::new(config);
        match session.start().await {
            Err(CommError::Config(_)) => {}
            other => panic!("{label} should fail with a Config error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn receive_session_reports_bound_address() {
    let mut session = Session::new(receive_config(TransportSpec::tcp_receive()));
    session.start().await.unwrap();

    let addr = session.local_addr().expect("bound address");
    assert_ne!(addr.port(), 0);

    session.stop().await;
}

#[tokio::test]
async fn loops_reach_stopped_after_stop() {
    let mut session = Session::new(receive_config(TransportSpec::tcp_receive()));
    session.start().await.unwrap();
    assert!(session
        .loop_states()
        .iter()
        .all(|s| matches!(s, LoopState::Running | LoopState::Idle)));

    session.stop().await;
    assert!(session
        .loop_states()
        .iter()
        .all(|s| matches!(s, LoopState::Stopped | LoopState::Stopping)));
}

#[tokio::test]
async fn stop_from_another_task() {
    let mut session = Session::new(receive_config(TransportSpec::udp_receive()));
    session.start().await.unwrap();
    let session = Arc::new(session);

    let stopper = session.clone();
    let handle = tokio::spawn(async move {
        stopper.stop().await;
    });
    handle.await.unwrap();

    // And again from this task; stop is idempotent
    session.stop().await;
}

#[tokio::test]
async fn enqueue_respects_box_capacity() {
    let config = send_config(TransportSpec::tcp_send(), 19322).with_overrides(|c| {
        c.box_lengths = vec![2];
    });
    // Never started: nothing drains the box, so the third enqueue must fail
    let session = Session::new(config);

    assert!(session.enqueue(vec![1]));
    assert!(session.enqueue(vec![2]));
    assert!(!session.enqueue(vec![3]));
    assert_eq!(
        session
            .metrics()
            .enqueue_rejected
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn probe_confirms_reachability() {
    let mut server = Session::new(receive_config(TransportSpec::tcp_receive()));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Session::new(send_config(TransportSpec::tcp_send(), port));
    let rtt = client
        .probe(Duration::from_secs(2))
        .await
        .expect("probe should succeed against a running receiver");
    assert!(rtt <= Duration::from_secs(2));

    server.stop().await;
}

#[tokio::test]
async fn probe_against_nothing_fails_without_killing_the_session() {
    let client = Session::new(send_config(TransportSpec::tcp_send(), 1));
    assert!(client.probe(Duration::from_millis(300)).await.is_err());
    // The session value is still usable afterwards
    assert!(client.dequeue().is_none());
}
