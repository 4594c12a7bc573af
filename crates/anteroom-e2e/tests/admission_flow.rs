//! Full-process admission flows against real Redis and NATS:
//!   docker run -d -p 6379:6379 redis:7-alpine
//!   docker run -d -p 4222:4222 nats:2-alpine
//! Build the workspace first, then run:
//!   cargo test -p anteroom-e2e -- --ignored

mod helpers;

use std::time::Duration;

use helpers::{create_queue, TestServer, ADMIN_KEY};

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires Redis (and optionally NATS) running
async fn health_is_green() {
    let server = TestServer::start();
    let response = client().get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
#[ignore] // Requires Redis (and optionally NATS) running
async fn enqueue_wait_admit_roundtrip() {
    let server = TestServer::start();
    let http = client();
    let queue = create_queue(&http, &server, 5.0).await;

    // Join the queue.
    let body: serde_json::Value = http
        .post(server.url(&format!("/api/v1/queues/{queue}/enqueue")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["position"], 1);
    let token = body["token"].as_str().unwrap().to_string();

    // Poll heartbeats until the admission loop lets us through. The loop
    // discovers a fresh queue within its 5 s registry scan.
    let mut admitted = None;
    for _ in 0..40 {
        let body: serde_json::Value = http
            .post(server.url(&format!("/api/v1/queues/{queue}/heartbeat")))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == "admitted" {
            admitted = Some(body);
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let admitted = admitted.expect("client should be admitted within the poll budget");
    assert_eq!(admitted["redirect_url"], "https://origin.example/checkout");

    // The session credential opens the session surface.
    let session_id = admitted["session_id"].as_str().unwrap();
    let session_token = admitted["session_token"].as_str().unwrap();
    let response = http
        .get(server.url(&format!("/api/v1/sessions/{session_id}")))
        .bearer_auth(session_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
#[ignore] // Requires Redis (and optionally NATS) running
async fn silent_client_expires_and_sees_gone() {
    let server = TestServer::start();
    let http = client();

    // Rate 0 keeps the admission loop parked; a short heartbeat timeout
    // lets the reaper strike quickly.
    let queue = format!("e2e-{}", uuid::Uuid::now_v7().simple());
    let response = http
        .post(server.url("/api/v1/admin/queues"))
        .header("x-admin-key", ADMIN_KEY)
        .json(&serde_json::json!({
            "name": queue,
            "target_url": "https://origin.example",
            "admission_rate": 0.0,
            "heartbeat_timeout_s": 2,
            "grace_period_s": 60,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = http
        .post(server.url(&format!("/api/v1/queues/{queue}/enqueue")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = body["token"].as_str().unwrap().to_string();

    // Go silent past the timeout plus a reaper tick.
    tokio::time::sleep(Duration::from_secs(4)).await;

    let response = http
        .post(server.url(&format!("/api/v1/queues/{queue}/heartbeat")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 410);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "position-expired");
}
