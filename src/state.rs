use crate::{
    config::Settings,
    credentials::{
        AccessTokenSource, CredentialsError, MetadataTokenSource, ServiceAccountKey,
        ServiceAccountTokenSource,
    },
    document_store::{DocumentStore, FirestoreClient},
    error::Result,
    fcm_sender::{FcmClient, HttpFcmClient},
};
use std::{sync::Arc, time::Duration};

const GOOGLE_CLOUD_PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

/// Shared application state
///
/// Built once at startup and handed to every pipeline invocation. Both
/// clients are safe to use from concurrent pipelines.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn DocumentStore>,
    pub fcm_client: Arc<FcmClient>,
}

impl AppState {
    /// Loads the service account and builds the Firestore and FCM clients.
    ///
    /// Fails if no usable credential artifact can be found.
    pub async fn new(settings: Settings) -> Result<Self> {
        let key = ServiceAccountKey::load(&settings.firebase)?;
        let http = http_client(&settings)?;
        Self::with_service_account(settings, http, key)
    }

    /// State for the trigger endpoint.
    ///
    /// Uses a configured service account if there is one, and otherwise the
    /// runtime's own identity from the platform metadata server.
    pub async fn for_trigger(settings: Settings) -> Result<Self> {
        let http = http_client(&settings)?;
        match ServiceAccountKey::load(&settings.firebase) {
            Ok(key) => Self::with_service_account(settings, http, key),
            Err(CredentialsError::NotConfigured) => {
                tracing::info!(
                    metadata_url = %settings.firebase.metadata_url,
                    "No service account configured, using platform credentials"
                );
                let metadata = Arc::new(MetadataTokenSource::new(
                    http.clone(),
                    &settings.firebase.metadata_url,
                ));
                let project_id = match configured_project_id(&settings) {
                    Some(project_id) => project_id,
                    None => metadata.project_id().await?,
                };
                tracing::info!(project_id = %project_id, "Resolved platform project");
                Self::from_token_source(settings, http, metadata, &project_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn with_service_account(
        settings: Settings,
        http: reqwest::Client,
        key: ServiceAccountKey,
    ) -> Result<Self> {
        let project_id = settings
            .firebase
            .project_id
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| key.project_id.clone());
        tracing::info!(project_id = %project_id, client_email = %key.client_email, "Loaded service account");

        let tokens = Arc::new(ServiceAccountTokenSource::new(
            key,
            settings.firebase.token_url.clone(),
            http.clone(),
        )?);
        Self::from_token_source(settings, http, tokens, &project_id)
    }

    fn from_token_source(
        settings: Settings,
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        project_id: &str,
    ) -> Result<Self> {
        let store = FirestoreClient::new(
            http.clone(),
            tokens.clone(),
            &settings.firebase.firestore_base_url,
            project_id,
            settings.listener.page_size,
        )?;
        let fcm = HttpFcmClient::new(http, tokens, &settings.firebase.fcm_base_url, project_id);

        Ok(AppState {
            settings,
            store: Arc::new(store),
            fcm_client: Arc::new(FcmClient::new(fcm)),
        })
    }

    /// Assembles state from already-built clients.
    pub fn with_clients(
        settings: Settings,
        store: Arc<dyn DocumentStore>,
        fcm_client: Arc<FcmClient>,
    ) -> Self {
        AppState {
            settings,
            store,
            fcm_client,
        }
    }
}

fn http_client(settings: &Settings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.firebase.http_timeout_secs))
        .build()?)
}

fn configured_project_id(settings: &Settings) -> Option<String> {
    settings
        .firebase
        .project_id
        .clone()
        .filter(|p| !p.is_empty())
        .or_else(|| std::env::var(GOOGLE_CLOUD_PROJECT_ENV).ok().filter(|p| !p.is_empty()))
}
