// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use base64::Engine as _;
use detkit_server::Config;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

async fn start_test_server(config: Config) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = detkit_server::create_app(config);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    Some((addr, server_handle))
}

#[tokio::test]
async fn health_reports_mode_and_clients() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let res = reqwest::get(format!("http://{addr}/api/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-content-type-options"], "nosniff");

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mode"], "wasm");
    assert_eq!(body["clients"], 0);
    assert!(body["timestamp"].as_str().unwrap().contains('T'));

    server_handle.abort();
}

#[tokio::test]
async fn mode_follows_configuration() {
    let mut config = Config::default();
    config.detection.mode = detkit_api::Mode::Remote;
    let Some((addr, server_handle)) = start_test_server(config).await else {
        return;
    };

    let body: Value =
        reqwest::get(format!("http://{addr}/api/mode")).await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({ "mode": "server" }));

    server_handle.abort();
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let res = reqwest::get(format!("http://{addr}/api/nonexistent")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].is_string());

    server_handle.abort();
}

#[tokio::test]
async fn unanswerable_offer_is_500_with_error() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let client = reqwest::Client::new();
    let res = client
        .post(format!("http://{addr}/api/webrtc/offer"))
        .json(&json!({
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
            "clientId": "test-client-123"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = res.json().await.unwrap();
    assert!(!body["error"].as_str().unwrap().is_empty());

    // A failed first offer does not register the client.
    let health: Value =
        reqwest::get(format!("http://{addr}/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["clients"], 0);

    // Malformed body is a client error, not a negotiation failure.
    let res = client
        .post(format!("http://{addr}/api/webrtc/offer"))
        .json(&json!({ "clientId": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    server_handle.abort();
}

#[tokio::test]
async fn ice_candidate_before_offer_is_accepted() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let client = reqwest::Client::new();
    let res = client
        .post(format!("http://{addr}/api/webrtc/ice-candidate"))
        .json(&json!({
            "candidate": {
                "candidate": "candidate:1 1 UDP 2130706431 192.168.1.100 54400 typ host",
                "sdpMLineIndex": 0,
                "sdpMid": "0"
            },
            "clientId": "test-client-123"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await.unwrap(), json!({ "success": true }));

    let health: Value =
        reqwest::get(format!("http://{addr}/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["clients"], 1);

    let res = client
        .delete(format!("http://{addr}/api/webrtc/clients/test-client-123"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let health: Value =
        reqwest::get(format!("http://{addr}/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["clients"], 0);

    server_handle.abort();
}

#[tokio::test]
async fn cors_and_origin_guard() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let client = reqwest::Client::new();
    let res = client
        .get(format!("http://{addr}/api/health"))
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["access-control-allow-origin"], "http://localhost:3000");

    let url = format!("http://{addr}/api/metrics/reset");
    let res = client.post(&url).header("Origin", "https://evil.example").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client.post(&url).header("Origin", "http://localhost:1234").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    server_handle.abort();
}

#[tokio::test]
async fn detect_records_processed_frame() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let client = reqwest::Client::new();
    let data = base64::engine::general_purpose::STANDARD.encode(vec![128u8; 8 * 6 * 3]);
    let res = client
        .post(format!("http://{addr}/api/detect"))
        .json(&json!({ "frame_id": 7, "width": 8, "height": 6, "capture_ts": 1000, "data": data }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let result: Value = res.json().await.unwrap();
    assert_eq!(result["frame_id"], 7);
    assert_eq!(result["capture_ts"], 1000);
    assert!(result["detections"].as_array().unwrap().len() <= 2);

    // Wrong payload size is refused and counted as dropped.
    let res = client
        .post(format!("http://{addr}/api/detect"))
        .json(&json!({ "frame_id": 8, "width": 8, "height": 6, "data": "AAAA" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let metrics: Value =
        reqwest::get(format!("http://{addr}/api/metrics")).await.unwrap().json().await.unwrap();
    assert_eq!(metrics["summary"]["processed_frames"], 1);
    assert_eq!(metrics["summary"]["dropped_frames"], 1);
    assert_eq!(metrics["summary"]["total_frames"], 2);

    server_handle.abort();
}

#[tokio::test]
async fn reported_metrics_feed_snapshot_until_reset() {
    let Some((addr, server_handle)) = start_test_server(Config::default()).await else {
        return;
    };

    let client = reqwest::Client::new();
    for (i, e2e) in [100u64, 200, 300].iter().enumerate() {
        let res = client
            .post(format!("http://{addr}/api/metrics/frame"))
            .json(&json!({
                "frame_id": i,
                "capture_ts": 10_000,
                "inference_ts": 10_000 + e2e / 2,
                "displayed_at": 10_000 + e2e
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = client
        .post(format!("http://{addr}/api/metrics/bandwidth"))
        .json(&json!({ "uplink_kbps": 800.0, "downlink_kbps": 120.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("http://{addr}/api/metrics/bandwidth"))
        .json(&json!({ "uplink_kbps": -1.0, "downlink_kbps": 120.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let metrics: Value =
        reqwest::get(format!("http://{addr}/api/metrics")).await.unwrap().json().await.unwrap();
    assert_eq!(metrics["summary"]["processed_frames"], 3);
    assert_eq!(metrics["latency"]["e2e"]["median"], 200.0);
    assert_eq!(metrics["latency"]["e2e"]["p95"], 300.0);
    assert_eq!(metrics["latency"]["network"]["p95"], 0.0);
    assert_eq!(metrics["bandwidth"]["uplink_kbps"]["median"], 800.0);

    let recent: Value = reqwest::get(format!("http://{addr}/api/metrics/recent"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recent["frames"], 3);

    client.post(format!("http://{addr}/api/metrics/reset")).send().await.unwrap();
    let metrics: Value =
        reqwest::get(format!("http://{addr}/api/metrics")).await.unwrap().json().await.unwrap();
    assert_eq!(metrics["summary"]["total_frames"], 0);
    assert_eq!(metrics["latency"]["e2e"]["median"], 0.0);

    server_handle.abort();
}
