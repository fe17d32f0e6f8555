// Startup credential handling for both deployments

use anyhow::Result;
use axum::{
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use order_push_service::{
    config::Settings,
    credentials::{CredentialsError, CREDENTIALS_BASE64_ENV, GOOGLE_APPLICATION_CREDENTIALS_ENV},
    error::ServiceError,
    models::Order,
    notifier::{self, PayloadStyle, PipelineOutcome},
    state::AppState,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn clear_credential_env() {
    std::env::remove_var(GOOGLE_APPLICATION_CREDENTIALS_ENV);
    std::env::remove_var(CREDENTIALS_BASE64_ENV);
    std::env::remove_var("GOOGLE_CLOUD_PROJECT");
}

fn has(headers: &HeaderMap, name: &str, value: &str) -> bool {
    headers.get(name).and_then(|v| v.to_str().ok()) == Some(value)
}

/// Stands in for the metadata server, Firestore and FCM on one port.
async fn spawn_platform(sent: Arc<Mutex<Vec<Value>>>) -> Result<String> {
    let app = Router::new().fallback(
        move |method: Method, uri: Uri, headers: HeaderMap, body: String| {
            let sent = sent.clone();
            async move {
                let path = uri.path();
                if path.starts_with("/computeMetadata/") {
                    if !has(&headers, "Metadata-Flavor", "Google") {
                        return StatusCode::FORBIDDEN.into_response();
                    }
                    return match path {
                        "/computeMetadata/v1/project/project-id" => "farmigo-app".into_response(),
                        "/computeMetadata/v1/instance/service-accounts/default/token" => {
                            Json(json!({ "access_token": "ya29.platform", "expires_in": 3599 }))
                                .into_response()
                        }
                        _ => StatusCode::NOT_FOUND.into_response(),
                    };
                }

                if !has(&headers, "authorization", "Bearer ya29.platform") {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                match (method, path) {
                    (Method::GET, "/v1/projects/farmigo-app/databases/(default)/documents/users/f1") => {
                        Json(json!({
                            "name": "projects/farmigo-app/databases/(default)/documents/users/f1",
                            "fields": { "fcmToken": { "stringValue": "tok123" } }
                        }))
                        .into_response()
                    }
                    (Method::POST, "/fcm/v1/projects/farmigo-app/messages:send") => {
                        let message: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                        sent.lock().unwrap().push(message);
                        Json(json!({ "name": "projects/farmigo-app/messages/42" })).into_response()
                    }
                    _ => StatusCode::NOT_FOUND.into_response(),
                }
            }
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(format!("http://{}", addr))
}

fn platform_settings(base: &str) -> Settings {
    let mut settings = Settings::default();
    settings.firebase.metadata_url = base.to_string();
    settings.firebase.firestore_base_url = format!("{}/v1", base);
    settings.firebase.fcm_base_url = format!("{}/fcm/v1", base);
    settings
}

#[tokio::test]
async fn test_listener_requires_service_account() -> Result<()> {
    clear_credential_env();

    let result = AppState::new(Settings::default()).await;

    assert!(matches!(
        result,
        Err(ServiceError::Credentials(CredentialsError::NotConfigured))
    ));
    Ok(())
}

#[tokio::test]
async fn test_trigger_uses_platform_credentials_without_key() -> Result<()> {
    clear_credential_env();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_platform(sent.clone()).await?;

    let state = AppState::for_trigger(platform_settings(&base)).await?;

    let order = Order {
        farmer_id: Some("f1".to_string()),
        buyer_name: Some("Asha".to_string()),
        total_amount: Some(250.0),
        created_at: None,
    };
    let outcome = notifier::notify_new_order(&state, "o1", &order, PayloadStyle::Trigger).await;

    assert_eq!(
        outcome,
        PipelineOutcome::Dispatched {
            receipt: "projects/farmigo-app/messages/42".to_string()
        }
    );
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let message = &sent[0]["message"];
    assert_eq!(message["token"], "tok123");
    assert_eq!(message["data"]["orderId"], "o1");
    assert_eq!(message["android"]["priority"], "high");
    Ok(())
}

#[tokio::test]
async fn test_trigger_fails_when_platform_is_unreachable() -> Result<()> {
    clear_credential_env();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, Router::new()).await });

    let result = AppState::for_trigger(platform_settings(&format!("http://{}", addr))).await;

    assert!(matches!(
        result,
        Err(ServiceError::Credentials(CredentialsError::MetadataRejected { status: 404, .. }))
    ));
    Ok(())
}
