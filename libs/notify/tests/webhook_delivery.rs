//! Webhook sink against a real local HTTP endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use hg_notify::{
    EventAlert, EventType, GateConfig, NotifierGate, Severity, Sink, WebhookConfig, WebhookSink,
};
use serde_json::Value;

type Received = Arc<Mutex<Vec<Value>>>;

async fn capture(State(received): State<Received>, Json(payload): Json<Value>) -> StatusCode {
    received.lock().unwrap().push(payload);
    StatusCode::NO_CONTENT
}

async fn reject(Json(_): Json<Value>) -> StatusCode {
    StatusCode::BAD_REQUEST
}

/// Binds a throwaway webhook endpoint and returns its URL plus the payload
/// capture buffer.
async fn spawn_endpoint(failing: bool) -> (String, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let router = if failing {
        Router::new().route("/hook", post(reject))
    } else {
        Router::new()
            .route("/hook", post(capture))
            .with_state(received.clone())
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}/hook"), received)
}

fn alert(event_type: EventType) -> EventAlert {
    EventAlert {
        agent_id: "agent-001".into(),
        token_id: "token-abc".into(),
        path: "/srv/decoys/payroll.xlsx".into(),
        event_type,
        timestamp: 1_700_000_000,
        severity: None,
    }
}

fn sink(url: String) -> WebhookSink {
    WebhookSink::new(WebhookConfig {
        enabled: true,
        webhook_url: url,
        ..WebhookConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn delivers_embed_payload() {
    let (url, received) = spawn_endpoint(false).await;
    let sink = sink(url);

    sink.send(&alert(EventType::Opened)).await.unwrap();

    let payloads = received.lock().unwrap().clone();
    assert_eq!(payloads.len(), 1);
    let embed = &payloads[0]["embeds"][0];
    assert!(embed["title"].as_str().unwrap().contains("CRITICAL"));
    assert_eq!(embed["fields"][1]["value"], "token-abc");
}

#[tokio::test]
async fn delivers_digest_through_gate_flush() {
    let (url, received) = spawn_endpoint(false).await;
    let gate = NotifierGate::new(
        GateConfig {
            min_severity: Severity::Info,
            rate_limit_seconds: 0,
            batch_mode: true,
            ..GateConfig::default()
        },
        Arc::new(sink(url)),
    );

    assert!(gate.notify(&alert(EventType::Modified)).await);
    assert!(gate.notify(&alert(EventType::Deleted)).await);
    assert!(received.lock().unwrap().is_empty());

    assert!(gate.flush_batch().await);
    let payloads = received.lock().unwrap().clone();
    assert_eq!(payloads.len(), 1);
    assert!(
        payloads[0]["embeds"][0]["title"]
            .as_str()
            .unwrap()
            .contains("2 Events")
    );
}

#[tokio::test]
async fn non_2xx_reported_as_failure() {
    let (url, _) = spawn_endpoint(true).await;
    let sink = sink(url);
    assert!(sink.send(&alert(EventType::Opened)).await.is_err());
}

#[tokio::test]
async fn unreachable_endpoint_reported_as_failure() {
    // Bind-then-drop guarantees a closed port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sink = sink(format!("http://{addr}/hook"));
    let result = tokio::time::timeout(
        Duration::from_secs(15),
        sink.send(&alert(EventType::Opened)),
    )
    .await
    .expect("send should fail fast");
    assert!(result.is_err());
}
