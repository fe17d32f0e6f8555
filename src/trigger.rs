//! Serverless-trigger deployment: the hosting platform POSTs each newly
//! created document to this endpoint, once per creation.

use crate::{
    document_store::FirestoreDocument,
    error::{Result, ServiceError},
    models::Order,
    notifier::{self, PayloadStyle, PipelineOutcome},
    state::AppState,
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A document path pattern such as `orders/{orderId}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl DocumentPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .map(|segment| {
                if segment.is_empty() {
                    return Err(ServiceError::Internal(format!(
                        "empty segment in document pattern {}",
                        pattern
                    )));
                }
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) if !name.is_empty() => Ok(Segment::Param(name.to_string())),
                    Some(_) => Err(ServiceError::Internal(format!(
                        "unnamed parameter in document pattern {}",
                        pattern
                    ))),
                    None => Ok(Segment::Literal(segment.to_string())),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches a document path, or a full resource name
    /// (`projects/.../documents/orders/o1`), returning the bound parameters.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let relative = match path.split_once("/documents/") {
            Some((_, rest)) => rest,
            None => path,
        };
        let parts: Vec<&str> = relative.trim_matches('/').split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

/// Binds the order pipeline to creation events on documents matching a pattern.
#[derive(Debug, Clone)]
pub struct TriggerRegistration {
    pub pattern: DocumentPattern,
    /// Parameter that carries the order id.
    pub id_param: String,
}

impl TriggerRegistration {
    /// Registers for `pattern`; its last parameter is taken as the order id.
    pub fn on_create(pattern: &str) -> Result<Self> {
        let pattern = DocumentPattern::parse(pattern)?;
        let id_param = pattern
            .segments
            .iter()
            .rev()
            .find_map(|s| match s {
                Segment::Param(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .ok_or_else(|| {
                ServiceError::Internal(format!(
                    "document pattern {} has no id parameter",
                    pattern.as_str()
                ))
            })?;
        Ok(Self { pattern, id_param })
    }

    /// The order id for a created document, if the document belongs to this trigger.
    pub fn order_id(&self, document_name: &str) -> Result<String> {
        self.pattern
            .matches(document_name)
            .and_then(|mut params| params.remove(&self.id_param))
            .ok_or_else(|| ServiceError::PatternMismatch {
                path: document_name.to_string(),
                pattern: self.pattern.as_str().to_string(),
            })
    }
}

/// Accepts both a bare document and the `{"value": document}` event envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TriggerBody {
    Envelope { value: FirestoreDocument },
    Document(FirestoreDocument),
}

impl TriggerBody {
    pub fn into_document(self) -> FirestoreDocument {
        match self {
            TriggerBody::Envelope { value } => value,
            TriggerBody::Document(document) => document,
        }
    }
}

struct TriggerContext {
    state: Arc<AppState>,
    registration: TriggerRegistration,
}

pub fn outcome_label(outcome: &PipelineOutcome) -> &'static str {
    match outcome {
        PipelineOutcome::Skipped(_) => "skipped",
        PipelineOutcome::Aborted(_) => "aborted",
        PipelineOutcome::Dispatched { .. } => "dispatched",
        PipelineOutcome::Failed(_) => "failed",
    }
}

async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn handle_created(
    State(ctx): State<Arc<TriggerContext>>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<serde_json::Value>> {
    let document = body.into_document();
    let order_id = ctx.registration.order_id(&document.name)?;
    let fields = document.decoded_fields()?;
    let order = Order::from_fields(&fields);

    let outcome =
        notifier::notify_new_order(&ctx.state, &order_id, &order, PayloadStyle::Trigger).await;

    // Every pipeline outcome is a handled invocation.
    Ok(Json(json!({
        "orderId": order_id,
        "outcome": outcome_label(&outcome),
    })))
}

pub fn router(state: Arc<AppState>, registration: TriggerRegistration) -> Router {
    let ctx = Arc::new(TriggerContext {
        state,
        registration,
    });
    Router::new()
        .route("/", post(handle_created))
        .route("/health", get(health_check))
        .with_state(ctx)
}

pub async fn run_server(
    app_state: Arc<AppState>,
    registration: TriggerRegistration,
    token: CancellationToken,
) -> Result<()> {
    let listen_addr_str = app_state.settings.server.listen_addr.clone();
    let addr: SocketAddr = listen_addr_str.parse().map_err(|e| {
        ServiceError::Internal(format!(
            "Invalid server.listen_addr '{}': {}",
            listen_addr_str, e
        ))
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        pattern = registration.pattern.as_str(),
        "Trigger server listening on {}",
        addr
    );

    let app = router(app_state, registration);
    let shutdown_token = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
            tracing::info!("Trigger server shutting down.");
        })
        .await?;
    Ok(())
}
