//! Session lifecycle over a live server: state survival across reconnects,
//! TTL reset, indexed field lookup, and connection replacement.

mod common;

use bytes::Bytes;
use common::{test_config, TestClient, FRAME_ACK, FRAME_DATA};
use framewire::{Qos, RpcContext, RpcRequest, Server, SessionToken};
use std::time::Duration;

/// `count:` increments a per-session field and returns it; `tag:<value>`
/// stores an indexed `city` field.
fn stateful_server() -> Server {
    let mut server = Server::new(test_config());
    server.register_fn("count", Qos::AtMostOnce, |_request, ctx: RpcContext| async move {
        let next = ctx
            .session()
            .get_field("count")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        ctx.session().set_field("count", &next.to_string(), false);
        Ok(Some(Bytes::from(next.to_string())))
    });
    server.register_fn("tag", Qos::AtMostOnce, |request: RpcRequest, ctx: RpcContext| async move {
        let value = String::from_utf8_lossy(&request.body).to_string();
        ctx.session().set_field("city", &value, true);
        Ok(Some(Bytes::from_static(b"ok")))
    });
    server
}

async fn count(client: &mut TestClient) -> u64 {
    client.send_frame(FRAME_DATA, 0, b"count:").await;
    let (_, _, payload) = client.recv_frame().await;
    String::from_utf8(payload).unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_state_survives_resume_within_ttl() {
    let handle = stateful_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let mut first = TestClient::connect(addr, "cli-s1", "dev-1", None).await;
    let token = first.session_token.clone();
    assert_eq!(count(&mut first).await, 1);
    first.close().await;

    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut second = TestClient::connect(addr, "cli-s1", "dev-1", Some(&token)).await;
    assert_eq!(second.session_token, token);
    assert_eq!(count(&mut second).await, 2);
}

#[tokio::test]
async fn test_state_resets_after_ttl() {
    let handle = stateful_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let mut first = TestClient::connect(addr, "cli-s2", "dev-1", None).await;
    let token = first.session_token.clone();
    assert_eq!(count(&mut first).await, 1);
    first.close().await;

    tokio::time::sleep(Duration::from_secs(4)).await;

    let mut second = TestClient::connect(addr, "cli-s2", "dev-1", Some(&token)).await;
    assert_ne!(second.session_token, token);
    assert_eq!(count(&mut second).await, 1);
}

#[tokio::test]
async fn test_indexed_lookup_tracks_liveness() {
    let handle = stateful_server().bind().await.unwrap();
    let addr = handle.local_addr();
    let store = handle.store().clone();

    let mut client = TestClient::connect(addr, "cli-s3", "dev-1", None).await;
    let token = client.session_token.clone();
    client.send_frame(FRAME_DATA, 0, b"tag:Paris").await;
    let (_, _, payload) = client.recv_frame().await;
    assert_eq!(payload, b"ok");

    let sessions = store.find_by("city", "Paris");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].token().as_str(), token);
    assert!(store.find_by("city", "Lyon").is_empty());

    client.close().await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(store.find_by("city", "Paris").is_empty());
}

#[tokio::test]
async fn test_new_connection_replaces_old() {
    let handle = stateful_server().bind().await.unwrap();
    let addr = handle.local_addr();

    let mut first = TestClient::connect(addr, "cli-s4", "dev-1", None).await;
    let mut second = TestClient::connect(addr, "cli-s4", "dev-1", None).await;
    assert_eq!(first.session_token, second.session_token);

    // The replaced connection is closed by the server.
    let closed = first.try_recv_frame(Duration::from_secs(1)).await;
    assert!(closed.is_none());

    // The replacement carries the session forward.
    assert_eq!(count(&mut second).await, 1);
    assert_eq!(count(&mut second).await, 2);
}

#[tokio::test]
async fn test_server_push_to_looked_up_session() {
    let handle = stateful_server().bind().await.unwrap();
    let addr = handle.local_addr();
    let store = handle.store().clone();

    let mut client = TestClient::connect(addr, "cli-s5", "dev-1", None).await;
    client.send_frame(FRAME_DATA, 0, b"tag:Berlin").await;
    let _ = client.recv_frame().await;

    for session in store.find_by("city", "Berlin") {
        session.send(&b"breaking news"[..], Qos::AtLeastOnce).await;
    }
    let (frame_type, id, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FRAME_DATA);
    assert_eq!(payload, b"breaking news");
    client.send_frame(FRAME_ACK, id, b"").await;
}

#[tokio::test]
async fn test_missing_identity_headers_reject_upgrade() {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let handle = stateful_server().bind().await.unwrap();
    let request = format!("ws://{}", handle.local_addr())
        .into_client_request()
        .unwrap();
    // No x-client-id / x-device-id headers: the upgrade is refused.
    let outcome = connect_async(request).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_store_lookup_by_token() {
    let handle = stateful_server().bind().await.unwrap();
    let client = TestClient::connect(handle.local_addr(), "cli-s6", "dev-1", None).await;
    let token = SessionToken::parse(&client.session_token);

    // Give the server a beat to run attach after the 101.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = handle.store().get(&token).expect("session registered");
    assert_eq!(session.client_id(), "cli-s6");
    assert_eq!(session.device_id(), "dev-1");
    assert!(session.is_attached());
}
