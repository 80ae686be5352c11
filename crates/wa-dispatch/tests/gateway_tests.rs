//! HTTP Gateway Tests
//!
//! Response classification against a mock Evolution-style API.

use std::time::Duration;

use serde_json::json;
use wa_common::{ConnectionState, GatewayOutcome, PresenceState, StepResult};
use wa_dispatch::{Gateway, HttpGateway, HttpGatewayConfig};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(server: &MockServer) -> HttpGateway {
    HttpGateway::new(HttpGatewayConfig {
        base_url: server.uri(),
        api_key: "secret-key".into(),
        timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
    })
    .unwrap()
}

#[tokio::test]
async fn test_send_delivered_with_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme-01"))
        .and(header("apikey", "secret-key"))
        .and(body_json(json!({"number": "5511999990000", "text": "hello"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "key": {"id": "3EB0C767D26A", "remoteJid": "5511999990000@s.whatsapp.net", "fromMe": true},
            "status": "PENDING"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway(&server).send("acme-01", "5511999990000", "hello").await;
    assert_eq!(outcome, GatewayOutcome::Delivered { message_id: Some("3EB0C767D26A".into()) });
}

#[tokio::test]
async fn test_send_rate_limited_reads_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme-01"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .mount(&server)
        .await;

    let outcome = gateway(&server).send("acme-01", "5511999990000", "hello").await;
    assert_eq!(outcome, GatewayOutcome::RateLimited { retry_after: Some(Duration::from_secs(120)) });
}

#[tokio::test]
async fn test_send_forbidden_is_ban() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme-01"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let outcome = gateway(&server).send("acme-01", "5511999990000", "hello").await;
    assert!(matches!(outcome, GatewayOutcome::Banned { .. }));
}

#[tokio::test]
async fn test_send_server_error_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme-01"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let outcome = gateway(&server).send("acme-01", "5511999990000", "hello").await;
    assert!(matches!(outcome, GatewayOutcome::TransportError { .. }));
}

#[tokio::test]
async fn test_send_timeout_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme-01"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let outcome = gateway(&server).send("acme-01", "5511999990000", "hello").await;
    assert!(matches!(outcome, GatewayOutcome::TransportError { .. }));
}

#[tokio::test]
async fn test_typing_posts_composing_presence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/sendPresence/acme-01"))
        .and(body_json(json!({"number": "5511999990000", "presence": "composing", "delay": 3000})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let result = gateway(&server)
        .set_typing("acme-01", "5511999990000", Duration::from_secs(3))
        .await;
    assert_eq!(result, StepResult::Ok);
}

#[tokio::test]
async fn test_presence_failure_is_soft() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/sendPresence/acme-01"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = gateway(&server)
        .set_presence("acme-01", "5511999990000", PresenceState::Paused)
        .await;
    assert!(matches!(result, StepResult::SoftFail(_)));
}

#[tokio::test]
async fn test_connection_state_open() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instance/connectionState/acme-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instance": {"instanceName": "acme-01", "state": "open"}
        })))
        .mount(&server)
        .await;

    let state = gateway(&server).connection_state("acme-01").await.unwrap();
    assert_eq!(state, ConnectionState::Open);
}

#[tokio::test]
async fn test_connection_state_gone_is_banned() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instance/connectionState/acme-01"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let state = gateway(&server).connection_state("acme-01").await.unwrap();
    assert_eq!(state, ConnectionState::Banned);
}

#[tokio::test]
async fn test_connection_state_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instance/connectionState/acme-01"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(gateway(&server).connection_state("acme-01").await.is_err());
}
