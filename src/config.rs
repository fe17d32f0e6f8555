use serde::Deserialize;
use std::path::Path;

pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub firebase: FirebaseSettings,
    #[serde(default)]
    pub collections: CollectionSettings,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FirebaseSettings {
    /// Falls back to the project id inside the service account.
    pub project_id: Option<String>,
    pub credentials_path: Option<String>,
    #[serde(default = "default_firestore_base_url")]
    pub firestore_base_url: String,
    #[serde(default = "default_fcm_base_url")]
    pub fcm_base_url: String,
    /// Overrides the token endpoint named in the service account.
    pub token_url: Option<String>,
    /// Platform metadata server, used for credentials when no service
    /// account is configured.
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionSettings {
    #[serde(default = "default_orders_collection")]
    pub orders: String,
    #[serde(default = "default_users_collection")]
    pub users: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenerSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Orders created longer ago than this are not notified. Unset means no limit.
    pub max_order_age_secs: Option<u64>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationSettings {
    #[serde(default = "default_android_channel_id")]
    pub android_channel_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_trigger_pattern")]
    pub trigger_pattern: String,
}

impl Default for FirebaseSettings {
    fn default() -> Self {
        Self {
            project_id: None,
            credentials_path: None,
            firestore_base_url: default_firestore_base_url(),
            fcm_base_url: default_fcm_base_url(),
            token_url: None,
            metadata_url: default_metadata_url(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            orders: default_orders_collection(),
            users: default_users_collection(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            max_order_age_secs: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            android_channel_id: default_android_channel_id(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trigger_pattern: default_trigger_pattern(),
        }
    }
}

fn default_firestore_base_url() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

fn default_fcm_base_url() -> String {
    "https://fcm.googleapis.com/v1".to_string()
}

fn default_metadata_url() -> String {
    "http://metadata.google.internal".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_orders_collection() -> String {
    "orders".to_string()
}

fn default_users_collection() -> String {
    "users".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_page_size() -> u32 {
    300
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_android_channel_id() -> String {
    "farmigo_channel_id".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_trigger_pattern() -> String {
    "orders/{orderId}".to_string()
}

impl Settings {
    /// Loads `config/settings.yaml` from the working directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(format!("Failed to get current dir: {}", e)))?;
        Self::from_path(config_dir.join("config").join("settings.yaml"))
    }

    pub fn from_path(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::from(config_path.as_ref()).required(true))
            // Eg.. `ORDER_PUSH__LISTENER__POLL_INTERVAL_MS=500` would override `listener.poll_interval_ms`
            .add_source(config::Environment::with_prefix("ORDER_PUSH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
