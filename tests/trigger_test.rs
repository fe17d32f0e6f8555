// Serverless trigger endpoint, served on a local port and called over HTTP

mod common;

use anyhow::Result;
use common::TestEnv;
use order_push_service::{
    fcm_sender::FcmError,
    notifier::{CLICK_ACTION, NOTIFICATION_TITLE},
    trigger::{self, TriggerRegistration},
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

struct TriggerServer {
    base_url: String,
    token: CancellationToken,
}

impl TriggerServer {
    async fn start(env: &TestEnv) -> Result<Self> {
        let registration = TriggerRegistration::on_create("orders/{orderId}")?;
        let app = trigger::router(env.state.clone(), registration);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        Ok(Self {
            base_url: format!("http://{}", addr),
            token,
        })
    }

    async fn post(&self, body: Value) -> Result<(u16, Value)> {
        let response = reqwest::Client::new()
            .post(format!("{}/", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok((status, response.json().await?))
    }
}

impl Drop for TriggerServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn created_event(path: &str, fields: Value) -> Value {
    json!({
        "value": {
            "name": format!("projects/farm-app/databases/(default)/documents/{}", path),
            "fields": fields,
            "createTime": "2026-10-19T08:00:00Z",
            "updateTime": "2026-10-19T08:00:00Z"
        }
    })
}

#[tokio::test]
async fn test_created_order_is_dispatched_with_trigger_payload() -> Result<()> {
    let env = TestEnv::new();
    env.add_farmer("f1", Some("tok123"));
    let server = TriggerServer::start(&env).await?;

    let (status, body) = server
        .post(created_event(
            "orders/o1",
            json!({
                "farmerId": { "stringValue": "f1" },
                "buyerName": { "stringValue": "Asha" },
                "totalAmount": { "integerValue": "250" }
            }),
        ))
        .await?;

    assert_eq!(status, 200);
    assert_eq!(body["orderId"], "o1");
    assert_eq!(body["outcome"], "dispatched");

    let sent = env.fcm.get_sent_messages();
    assert_eq!(sent.len(), 1);
    let (token, payload) = &sent[0];
    assert_eq!(token, "tok123");

    let notification = payload.notification.as_ref().unwrap();
    assert_eq!(notification.title.as_deref(), Some(NOTIFICATION_TITLE));
    assert_eq!(
        notification.body.as_deref(),
        Some("You have a new order from Asha for ₹250.")
    );

    let data = payload.data.as_ref().unwrap();
    assert_eq!(data.get("orderId").map(String::as_str), Some("o1"));
    assert_eq!(data.get("type").map(String::as_str), Some("order"));
    assert_eq!(data.get("click_action").map(String::as_str), Some(CLICK_ACTION));

    let android = payload.android.as_ref().unwrap();
    assert_eq!(android["priority"], "high");
    assert_eq!(android["notification"]["channel_id"], "farmigo_channel_id");
    Ok(())
}

#[tokio::test]
async fn test_bare_document_body_is_accepted() -> Result<()> {
    let env = TestEnv::new();
    env.add_farmer("f1", Some("tok123"));
    let server = TriggerServer::start(&env).await?;

    let (status, body) = server
        .post(json!({
            "name": "orders/o2",
            "fields": { "farmerId": { "stringValue": "f1" } }
        }))
        .await?;

    assert_eq!(status, 200);
    assert_eq!(body["outcome"], "dispatched");
    let sent = env.fcm.get_sent_messages();
    assert_eq!(
        sent[0].1.notification.as_ref().unwrap().body.as_deref(),
        Some("You have a new order from a buyer for ₹0.")
    );
    Ok(())
}

#[tokio::test]
async fn test_aborted_and_failed_outcomes_still_succeed() -> Result<()> {
    let env = TestEnv::new();
    env.add_farmer("no_token", None);
    env.add_farmer("broken", Some("bad-token"));
    env.fcm.set_error_for_token(
        "bad-token",
        FcmError::InvalidRequest("The registration token is not a valid FCM registration token".to_string()),
    );
    let server = TriggerServer::start(&env).await?;

    let (status, body) = server
        .post(created_event("orders/a1", json!({})))
        .await?;
    assert_eq!((status, body["outcome"].clone()), (200, json!("aborted")));

    let (status, body) = server
        .post(created_event(
            "orders/a2",
            json!({ "farmerId": { "stringValue": "no_token" } }),
        ))
        .await?;
    assert_eq!((status, body["outcome"].clone()), (200, json!("aborted")));

    let (status, body) = server
        .post(created_event(
            "orders/a3",
            json!({ "farmerId": { "stringValue": "broken" } }),
        ))
        .await?;
    assert_eq!((status, body["outcome"].clone()), (200, json!("failed")));

    assert_eq!(env.fcm.attempts(), 1);
    // The order without a farmerId never reached the profile lookup.
    assert_eq!(env.store.lookups().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_document_outside_pattern_is_rejected() -> Result<()> {
    let env = TestEnv::new();
    env.add_farmer("f1", Some("tok123"));
    let server = TriggerServer::start(&env).await?;

    let (status, body) = server
        .post(created_event(
            "users/f1",
            json!({ "farmerId": { "stringValue": "f1" } }),
        ))
        .await?;

    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("orders/{orderId}"));
    assert!(env.store.lookups().is_empty());
    assert_eq!(env.fcm.attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let env = TestEnv::new();
    let server = TriggerServer::start(&env).await?;

    let response = reqwest::get(format!("{}/health", server.base_url)).await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await?, "OK");
    Ok(())
}
