//! HTTP boundary: `POST /inference` and `GET /health` over a shared [`ModelHost`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use soundclass::service::{InferenceError, ModelHost, Prediction, ServiceState};

use crate::config::ServiceConfig;

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    /// Base64-encoded audio file.
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InferenceQuery {
    #[serde(default)]
    pub visualize: bool,
}

#[derive(Debug, Serialize)]
struct PredictionsResponse {
    predictions: Vec<Prediction>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    state: ServiceState,
    classes: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum HttpError {
    /// Extractor failure; keeps axum's status (400/413/415/422).
    Rejected(StatusCode, String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl From<InferenceError> for HttpError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Audio(_)
            | InferenceError::NoChannels
            | InferenceError::UnsupportedSampleRate(_)
            | InferenceError::ClipTooLong { .. } => Self::BadRequest(e.to_string()),
            InferenceError::NotReady(_) => Self::Unavailable(e.to_string()),
            InferenceError::AlreadyStarted | InferenceError::Load(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for HttpError {
    fn from(e: JsonRejection) -> Self {
        Self::Rejected(e.status(), e.body_text())
    }
}

impl From<QueryRejection> for HttpError {
    fn from(e: QueryRejection) -> Self {
        Self::Rejected(e.status(), e.body_text())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::Rejected(status, msg) => (status, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn build_router(host: Arc<ModelHost>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/inference", post(inference))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(host)
}

async fn health(State(host): State<Arc<ModelHost>>) -> Response {
    let state = host.state();
    let classes = host.service().map_or(0, |s| s.classes().len());
    let (code, status) = match state {
        ServiceState::Ready => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (
        code,
        Json(HealthResponse {
            status,
            state,
            classes,
        }),
    )
        .into_response()
}

async fn inference(
    State(host): State<Arc<ModelHost>>,
    query: Result<Query<InferenceQuery>, QueryRejection>,
    body: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Response, HttpError> {
    let started = Instant::now();
    let Query(query) = query?;
    let Json(body) = body?;
    host.service()?;

    let audio = base64::engine::general_purpose::STANDARD
        .decode(body.data.trim())
        .map_err(|e| HttpError::BadRequest(format!("invalid base64 payload: {e}")))?;
    tracing::info!(bytes = audio.len(), visualize = query.visualize, "inference request");

    let host_bg = Arc::clone(&host);
    let visualize = query.visualize;
    let result = tokio::task::spawn_blocking(move || -> Result<Response, InferenceError> {
        let service = host_bg.service()?;
        if visualize {
            Ok(Json(service.analyze_bytes(&audio)?).into_response())
        } else {
            let predictions = service.classify_bytes(&audio)?;
            Ok(Json(PredictionsResponse { predictions }).into_response())
        }
    })
    .await
    .map_err(|e| HttpError::Internal(format!("inference join error: {e}")))?;

    match result {
        Ok(resp) => {
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "inference done");
            Ok(resp)
        }
        Err(e) => {
            tracing::warn!(error = %e, "inference failed");
            Err(e.into())
        }
    }
}

/// Bind `cfg.bind` and serve until ctrl-c.
pub async fn serve(host: Arc<ModelHost>, cfg: &ServiceConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    tracing::info!(addr = %listener.local_addr().context("local addr")?, "listening");
    axum::serve(listener, build_router(host, cfg.max_request_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
}
