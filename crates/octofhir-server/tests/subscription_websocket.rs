//! End-to-end delivery: register over REST, listen over WebSocket, write resources.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use octofhir_server::{AppConfig, build_app};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let (app, _state) = build_app(&AppConfig::default()).await.expect("build app");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("{addr}"), tx, server)
}

async fn register(client: &reqwest::Client, host: &str, criteria: &str, payload: Option<&str>) -> String {
    let mut channel = json!({ "type": "websocket" });
    if let Some(mime) = payload {
        channel["payload"] = json!(mime);
    }
    let resp = client
        .post(format!("http://{host}/fhir/Subscription"))
        .json(&json!({
            "resourceType": "Subscription",
            "status": "requested",
            "reason": "test",
            "criteria": criteria,
            "channel": channel,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "active");
    body["id"].as_str().unwrap().to_string()
}

async fn write_observation(client: &reqwest::Client, host: &str, subject: &str) -> String {
    let resp = client
        .post(format!("http://{host}/fhir/Observation"))
        .json(&json!({
            "resourceType": "Observation",
            "status": "final",
            "code": { "coding": [{ "system": "http://loinc.org", "code": "8867-4" }] },
            "subject": { "reference": subject },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

async fn next_text(ws: &mut WsClient) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.to_string()),
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

async fn assert_silent(ws: &mut WsClient) {
    match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(other) => panic!("expected no frame, got {other:?}"),
    }
}

/// True once the server has closed the socket.
async fn closed_by_server(ws: &mut WsClient) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

async fn bind(host: &str, id: &str) -> WsClient {
    let (mut ws, _) = connect_async(format!("ws://{host}/websocket")).await.unwrap();
    ws.send(Message::Text(format!("bind {id}").into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some(format!("bound {id}").as_str()));
    ws
}

#[tokio::test]
async fn matching_write_sends_one_frame_with_the_subscription_id() {
    let (host, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let id = register(&client, &host, "Observation?subject=Patient/123", None).await;
    let mut ws = bind(&host, &id).await;

    write_observation(&client, &host, "Patient/999").await;
    assert_silent(&mut ws).await;

    write_observation(&client, &host, "Patient/123").await;
    assert_eq!(next_text(&mut ws).await, Some(id.clone()));
    assert_silent(&mut ws).await;

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn events_endpoint_delivers_json_payload() {
    let (host, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let id = register(&client, &host, "Observation?code=8867-4", Some("application/fhir+json")).await;
    let (mut ws, _) = connect_async(format!("ws://{host}/fhir/Subscription/{id}/$events"))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, Some(format!("bound {id}")));

    let obs_id = write_observation(&client, &host, "Patient/1").await;
    let frame = next_text(&mut ws).await.expect("notification");
    let resource: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(resource["resourceType"], "Observation");
    assert_eq!(resource["id"], obs_id);

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn bind_protocol_reports_errors_and_allows_retry() {
    let (host, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let id = register(&client, &host, "Observation", None).await;

    let (mut ws, _) = connect_async(format!("ws://{host}/websocket/v1")).await.unwrap();

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("error Invalid bind request"));

    ws.send(Message::Text("bind 424242".into())).await.unwrap();
    let reply = next_text(&mut ws).await.unwrap();
    assert!(reply.starts_with("error "), "{reply}");
    assert!(reply.contains("424242"), "{reply}");

    ws.send(Message::Text(format!("bind {id}").into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, Some(format!("bound {id}")));

    // A second client for the same subscription is refused
    let (mut second, _) = connect_async(format!("ws://{host}/websocket")).await.unwrap();
    second.send(Message::Text(format!("bind {id}").into())).await.unwrap();
    let reply = next_text(&mut second).await.unwrap();
    assert!(reply.starts_with("error "), "{reply}");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn events_endpoint_rejects_unknown_subscription() {
    let (host, shutdown_tx, handle) = start_server().await;
    let result = connect_async(format!("ws://{host}/fhir/Subscription/999/$events")).await;
    assert!(result.is_err());

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn deactivation_closes_the_channel() {
    let (host, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let id = register(&client, &host, "Observation", None).await;
    let mut ws = bind(&host, &id).await;

    let resp = client
        .put(format!("http://{host}/fhir/Subscription/{id}"))
        .json(&json!({ "resourceType": "Subscription", "id": id, "status": "off" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(closed_by_server(&mut ws).await);

    let status: Value = client
        .get(format!("http://{host}/fhir/Subscription/{id}/$status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "off");
    assert_eq!(status["channelState"], "disconnected");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn one_disconnected_client_does_not_affect_another() {
    let (host, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let kept_id = register(&client, &host, "Observation?subject=Patient/7", None).await;
    let dropped_id = register(&client, &host, "Observation?status=final", None).await;

    let mut kept = bind(&host, &kept_id).await;
    let mut dropped = bind(&host, &dropped_id).await;
    dropped.close(None).await.unwrap();
    drop(dropped);

    write_observation(&client, &host, "Patient/7").await;
    assert_eq!(next_text(&mut kept).await, Some(kept_id));

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
