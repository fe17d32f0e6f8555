// Common test utilities shared by the integration tests

#![allow(dead_code)]

use order_push_service::{
    config::Settings,
    document_store::{Fields, InMemoryDocumentStore},
    fcm_sender::{FcmClient, MockFcmSender},
    state::AppState,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Global counter for unique test IDs
static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get a unique test ID for data isolation
pub fn get_unique_test_id() -> u64 {
    TEST_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Generate unique test token
pub fn generate_test_token(prefix: &str) -> String {
    format!("test_token_{}_{}", prefix, get_unique_test_id())
}

pub fn fields(value: serde_json::Value) -> Fields {
    value
        .as_object()
        .cloned()
        .expect("test fields must be a JSON object")
}

pub struct TestEnv {
    pub state: Arc<AppState>,
    pub store: InMemoryDocumentStore,
    pub fcm: MockFcmSender,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = InMemoryDocumentStore::new();
        let fcm = MockFcmSender::new();
        let fcm_client = Arc::new(FcmClient::new_with_impl(Box::new(fcm.clone())));
        let state = Arc::new(AppState::with_clients(
            settings,
            Arc::new(store.clone()),
            fcm_client,
        ));
        Self { state, store, fcm }
    }

    pub fn add_farmer(&self, farmer_id: &str, token: Option<&str>) {
        let profile = match token {
            Some(token) => serde_json::json!({ "fcmToken": token, "role": "farmer" }),
            None => serde_json::json!({ "role": "farmer" }),
        };
        self.store.put("users", farmer_id, fields(profile));
    }

    pub fn add_order(&self, order_id: &str, order: serde_json::Value) {
        self.store.put("orders", order_id, fields(order));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_test_ids() {
        let id1 = get_unique_test_id();
        let id2 = get_unique_test_id();
        assert_ne!(id1, id2, "Test IDs should be unique");
    }

    #[test]
    fn test_unique_tokens() {
        let token1 = generate_test_token("test");
        let token2 = generate_test_token("test");
        assert_ne!(token1, token2, "Tokens should be unique");
    }
}
