//! QoS1 at-least-once delivery over a live server: the ACK loop, retries,
//! replay on resume, purge after TTL, and inbound dedup.

mod common;

use common::{test_config, TestClient, FRAME_ACK, FRAME_DATA};
use framewire::{Qos, RpcRequest, Server};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn qos1_echo_server() -> Server {
    let mut server = Server::new(test_config());
    server.register_fn("echo", Qos::AtLeastOnce, |request: RpcRequest, _ctx| async move {
        Ok(Some(request.body))
    });
    server
}

#[tokio::test]
async fn test_response_retried_until_acked() {
    let handle = qos1_echo_server().bind().await.unwrap();
    let mut client = TestClient::connect(handle.local_addr(), "cli-r", "dev-1", None).await;

    client.send_frame(FRAME_DATA, 0, b"echo:ping").await;
    let (frame_type, id, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FRAME_DATA);
    assert_eq!(payload, b"ping");

    // Withhold the ACK: the identical frame comes around again.
    let (retry_type, retry_id, retry_payload) = client.recv_frame().await;
    assert_eq!(retry_type, FRAME_DATA);
    assert_eq!(retry_id, id);
    assert_eq!(retry_payload, payload);

    client.send_frame(FRAME_ACK, id, b"").await;
    let quiet = client.try_recv_frame(Duration::from_millis(500)).await;
    assert!(quiet.is_none(), "no retry after ACK, got {quiet:?}");
}

#[tokio::test]
async fn test_replay_on_resume_within_ttl() {
    let handle = qos1_echo_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let mut first = TestClient::connect(addr, "cli-a", "dev-1", None).await;
    let token = first.session_token.clone();
    first.send_frame(FRAME_DATA, 0, b"echo:ping").await;
    let (_, id, payload) = first.recv_frame().await;
    assert_eq!(payload, b"ping");
    // Close without ACKing: the entry stays in the outbox.
    first.close().await;

    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut second = TestClient::connect(addr, "cli-a", "dev-1", Some(&token)).await;
    assert_eq!(second.session_token, token, "session resumed");
    let (_, replay_id, replay_payload) = second.recv_frame().await;
    assert_eq!(replay_id, id);
    assert_eq!(replay_payload, b"ping");

    second.send_frame(FRAME_ACK, replay_id, b"").await;
    let quiet = second.try_recv_frame(Duration::from_millis(500)).await;
    assert!(quiet.is_none(), "no retry after ACK, got {quiet:?}");
}

#[tokio::test]
async fn test_no_replay_after_ttl() {
    let handle = qos1_echo_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let mut first = TestClient::connect(addr, "cli-b", "dev-1", None).await;
    let token = first.session_token.clone();
    first.send_frame(FRAME_DATA, 0, b"echo:ping").await;
    let _ = first.recv_frame().await;
    first.close().await;

    // Outlive the 3 s idle TTL.
    tokio::time::sleep(Duration::from_secs(4)).await;

    let mut second = TestClient::connect(addr, "cli-b", "dev-1", Some(&token)).await;
    assert_ne!(second.session_token, token, "stale token yields a new session");
    let quiet = second.try_recv_frame(Duration::from_secs(1)).await;
    assert!(quiet.is_none(), "no replay after TTL, got {quiet:?}");
}

#[tokio::test]
async fn test_duplicate_request_ids_execute_once() {
    let hits = Arc::new(AtomicU32::new(0));
    let mut server = Server::new(test_config());
    let counter = hits.clone();
    server.register_fn("inc", Qos::AtLeastOnce, move |_request, _ctx| {
        let counter = counter.clone();
        async move {
            let value = counter.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(Some(bytes::Bytes::from(value.to_string())))
        }
    });
    let handle = server.bind().await.unwrap();
    let mut client = TestClient::connect(handle.local_addr(), "cli-c", "dev-1", None).await;

    client.send_frame(FRAME_DATA, 21, b"inc:").await;
    client.send_frame(FRAME_DATA, 21, b"inc:").await;

    let (frame_type, id, _) = client.recv_frame().await;
    assert_eq!(frame_type, FRAME_ACK);
    assert_eq!(id, 21);

    let (frame_type, id, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FRAME_DATA);
    assert_eq!(id, 21);
    assert_eq!(payload, b"1");
    client.send_frame(FRAME_ACK, id, b"").await;

    let quiet = client.try_recv_frame(Duration::from_millis(500)).await;
    assert!(quiet.is_none(), "duplicate produced output: {quiet:?}");
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_send_ordering_across_resume() {
    let handle = qos1_echo_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let first = TestClient::connect(addr, "cli-d", "dev-1", None).await;
    let token = first.session_token.clone();
    first.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Queue pushes while detached; replay must preserve send order.
    let store = handle.store().clone();
    let sessions = store.find_by("missing", "nothing");
    assert!(sessions.is_empty());
    let session = store
        .get(&token_of(&token))
        .expect("session alive within TTL");
    session.send(&b"first"[..], Qos::AtLeastOnce).await;
    session.send(&b"second"[..], Qos::AtLeastOnce).await;

    let mut resumed = TestClient::connect(addr, "cli-d", "dev-1", Some(&token)).await;
    let (_, id_a, payload_a) = resumed.recv_frame().await;
    assert_eq!(payload_a, b"first");
    let (_, id_b, payload_b) = resumed.recv_frame().await;
    assert_eq!(payload_b, b"second");
    resumed.send_frame(FRAME_ACK, id_a, b"").await;
    resumed.send_frame(FRAME_ACK, id_b, b"").await;
}

#[tokio::test]
async fn test_ack_flood_is_harmless() {
    let handle = qos1_echo_server().bind().await.unwrap();
    let mut client = TestClient::connect(handle.local_addr(), "cli-e", "dev-1", None).await;

    for id in 1..=500u64 {
        client.send_frame(FRAME_ACK, id, b"").await;
    }
    client.send_frame(FRAME_DATA, 0, b"echo:flood").await;
    let (_, id, payload) = client.recv_frame().await;
    assert_eq!(payload, b"flood");
    client.send_frame(FRAME_ACK, id, b"").await;
}

fn token_of(raw: &str) -> framewire::SessionToken {
    framewire::SessionToken::parse(raw)
}
