//! Shared harness for integration tests: an ephemeral-port server config
//! and a minimal binary-frame WebSocket client speaking the wire protocol
//! (1-byte type + 8-byte big-endian id + payload).

// Not every test file uses every helper.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use framewire::Config;

pub const FRAME_DATA: u8 = 0;
pub const FRAME_ACK: u8 = 1;
pub const FRAME_PREPARE: u8 = 2;
pub const FRAME_PREPARE_ACK: u8 = 3;
pub const FRAME_COMMIT: u8 = 4;
pub const FRAME_COMPLETE: u8 = 5;

/// Default config bound to an ephemeral loopback port.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub session_token: String,
}

impl TestClient {
    pub async fn connect(
        addr: SocketAddr,
        client_id: &str,
        device_id: &str,
        token: Option<&str>,
    ) -> Self {
        let mut request = format!("ws://{addr}")
            .into_client_request()
            .expect("client request");
        let headers = request.headers_mut();
        headers.insert("x-client-id", HeaderValue::from_str(client_id).unwrap());
        headers.insert("x-device-id", HeaderValue::from_str(device_id).unwrap());
        if let Some(token) = token {
            headers.insert("x-session-token", HeaderValue::from_str(token).unwrap());
        }
        let (ws, response) = connect_async(request).await.expect("websocket connect");
        let session_token = response
            .headers()
            .get("x-session-token")
            .and_then(|value| value.to_str().ok())
            .expect("x-session-token response header")
            .to_string();
        Self { ws, session_token }
    }

    pub async fn send_frame(&mut self, frame_type: u8, id: u64, payload: &[u8]) {
        let mut raw = Vec::with_capacity(9 + payload.len());
        raw.push(frame_type);
        raw.extend_from_slice(&id.to_be_bytes());
        raw.extend_from_slice(payload);
        self.ws.send(Message::Binary(raw)).await.expect("send frame");
    }

    pub async fn send_frame_raw(&mut self, raw: Vec<u8>) {
        self.ws.send(Message::Binary(raw)).await.expect("send raw");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send text");
    }

    /// Next binary frame, skipping WebSocket control messages. Panics when
    /// nothing arrives within three seconds.
    pub async fn recv_frame(&mut self) -> (u8, u64, Vec<u8>) {
        self.try_recv_frame(Duration::from_secs(3))
            .await
            .expect("frame expected")
    }

    /// Next binary frame within the window; None on timeout or close.
    pub async fn try_recv_frame(&mut self, window: Duration) -> Option<(u8, u64, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            let message = tokio::time::timeout(remaining, self.ws.next()).await.ok()??;
            match message.ok()? {
                Message::Binary(raw) if raw.len() >= 9 => {
                    let id = u64::from_be_bytes(raw[1..9].try_into().unwrap());
                    return Some((raw[0], id, raw[9..].to_vec()));
                }
                _ => {}
            }
        }
    }

    /// Wait for a frame of the given type, tolerating retransmissions of
    /// other types along the way (stage retries of a QoS2 handshake).
    pub async fn recv_frame_of_type(&mut self, expected: u8) -> (u64, Vec<u8>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            if let Some((frame_type, id, payload)) =
                self.try_recv_frame(Duration::from_millis(500)).await
            {
                if frame_type == expected {
                    return (id, payload);
                }
            }
        }
        panic!("frame of type {expected} expected");
    }

    /// Drive a full client-side QoS2 exchange for one request and return
    /// the final response payload.
    pub async fn rpc_qos2(&mut self, payload: &[u8]) -> (u64, Vec<u8>) {
        self.send_frame(FRAME_DATA, 0, payload).await;
        let (id, _) = self.recv_frame_of_type(FRAME_PREPARE).await;
        self.send_frame(FRAME_PREPARE_ACK, id, b"").await;
        let (commit_id, _) = self.recv_frame_of_type(FRAME_COMMIT).await;
        assert_eq!(commit_id, id);
        self.send_frame(FRAME_COMPLETE, id, b"").await;
        let (data_id, body) = self.recv_frame_of_type(FRAME_DATA).await;
        assert_eq!(data_id, id);
        (id, body)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
