// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use detkit_api::{IceCandidateInit, SessionDescription};
use detkit_server::transport::{
    PeerConfig, PeerConnection, TransportConnector, TransportError, TransportEvent,
};
use detkit_server::Config;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

/// Answers every offer and immediately gathers one local candidate.
struct EchoConnector;

struct EchoConnection;

#[async_trait]
impl PeerConnection for EchoConnection {
    async fn set_remote_description(&self, _: &SessionDescription) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn add_ice_candidate(&self, _: &IceCandidateInit) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl TransportConnector for EchoConnector {
    async fn connect(
        &self,
        _client_id: &str,
        _config: &PeerConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let candidate = IceCandidateInit {
            candidate: "candidate:local".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = events.send(TransportEvent::LocalCandidate(candidate)).await;
        });
        Ok(Box::new(EchoConnection))
    }
}

async fn start_test_server(
    connector: Arc<dyn TransportConnector>,
) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = detkit_server::create_app_with(Config::default(), connector);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    Some((addr, server_handle))
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_rejects_disallowed_origin() {
    let Some((addr, server_handle)) = start_test_server(Arc::new(EchoConnector)).await else {
        return;
    };

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert("Origin", "https://evil.example".parse().unwrap());

    let err = tokio_tungstenite::connect_async(req).await.unwrap_err();
    let tokio_tungstenite::tungstenite::Error::Http(response) = err else {
        panic!("Expected HTTP error, got: {err:?}");
    };
    assert_eq!(response.status(), 403);

    server_handle.abort();
}

#[tokio::test]
async fn websocket_negotiates_and_relays_candidates() {
    let Some((addr, server_handle)) = start_test_server(Arc::new(EchoConnector)).await else {
        return;
    };

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["mode"], "wasm");
    let socket_id = welcome["clientId"].as_str().unwrap().to_string();

    // No clientId: the socket's own id is used.
    ws.send(Message::Text(
        json!({ "type": "offer", "offer": { "type": "offer", "sdp": "v=0\r\n" } })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let answer = next_json(&mut ws).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["clientId"], socket_id.as_str());
    assert_eq!(answer["answer"]["type"], "answer");

    let candidate = next_json(&mut ws).await;
    assert_eq!(candidate["type"], "ice-candidate");
    assert_eq!(candidate["clientId"], socket_id.as_str());
    assert_eq!(candidate["candidate"]["candidate"], "candidate:local");

    ws.send(Message::Text(json!({ "type": "get-metrics" }).to_string().into())).await.unwrap();
    let metrics = next_json(&mut ws).await;
    assert_eq!(metrics["type"], "metrics");
    assert_eq!(metrics["metrics"]["summary"]["total_frames"], 0);

    ws.send(Message::Text(json!({ "type": "start-stream", "clientId": "other" }).to_string().into()))
        .await
        .unwrap();
    let started = next_json(&mut ws).await;
    assert_eq!(started, json!({ "type": "stream-started", "clientId": "other" }));

    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");

    let health: Value =
        reqwest::get(format!("http://{addr}/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["clients"], 1);

    // Closing the socket removes the client it negotiated.
    ws.close(None).await.unwrap();
    drop(ws);
    sleep(Duration::from_millis(100)).await;
    let health: Value =
        reqwest::get(format!("http://{addr}/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["clients"], 0);

    server_handle.abort();
}

#[tokio::test]
async fn websocket_offer_failure_is_reported() {
    let Some((addr, server_handle)) =
        start_test_server(Arc::new(detkit_server::transport::UnavailableConnector)).await
    else {
        return;
    };

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _welcome = next_json(&mut ws).await;

    ws.send(Message::Text(
        json!({
            "type": "offer",
            "clientId": "cam-7",
            "offer": { "type": "offer", "sdp": "v=0\r\n" }
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["clientId"], "cam-7");

    server_handle.abort();
}
