//! HTTP ingest surface.
//!
//! * `POST /events` validates an [`IngestEvent`] and enqueues it for the
//!   worker pool.
//! * `POST /sign-in-requests` runs the rate-limit gate for one identity.
//! * `GET /health` reports queue depth and reference data counts.

use crate::core::ValidationError;
use crate::internal_metrics::Metrics;
use crate::pipeline::IngestEvent;
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::reference::ReferenceStore;
use async_channel::{Sender, TrySendError};
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("event queue is full")]
    QueueFull,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("too many requests, retry after {reset_at}")]
    RateLimited { reset_at: DateTime<Utc>, retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::QueueFull | ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let ApiError::RateLimited {
            reset_at,
            retry_after_secs,
        } = &self
        {
            let body = Json(json!({
                "allowed": false,
                "reset_at": reset_at,
                "error": self.to_string(),
            }));
            let mut response = (status, body).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            return response;
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub events_tx: Sender<IngestEvent>,
    pub rate_limiter: RateLimiter,
    pub reference: ReferenceStore,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub identity: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignInResponse {
    pub allowed: bool,
    pub remaining: u32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/sign-in-requests", post(sign_in_request))
        .route("/health", get(health))
        .with_state(state)
}

async fn ingest_event(
    State(state): State<ApiState>,
    Json(event): Json<IngestEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(e) = event.validate() {
        state.metrics.events_rejected_total.increment(1);
        debug!(error = %e, "Rejected event at the API boundary");
        return Err(e.into());
    }
    match state.events_tx.try_send(event) {
        Ok(()) => {
            state.metrics.set_events_queued(state.events_tx.len());
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
        }
        Err(TrySendError::Full(_)) => {
            state.metrics.events_dropped_total.increment(1);
            warn!("Event queue is full, refusing event");
            Err(ApiError::QueueFull)
        }
        Err(TrySendError::Closed(_)) => Err(ApiError::ShuttingDown),
    }
}

async fn sign_in_request(
    State(state): State<ApiState>,
    Json(request): Json<SignInRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.identity.trim().is_empty() {
        return Err(ApiError::BadRequest("identity must not be empty".to_string()));
    }
    match state.rate_limiter.try_acquire(&request.identity).await {
        Ok(decision) => Ok((
            StatusCode::ACCEPTED,
            Json(SignInResponse {
                allowed: true,
                remaining: decision.remaining,
            }),
        )),
        Err(RateLimitError::Exceeded { reset_at }) => Err(ApiError::RateLimited {
            reset_at,
            retry_after_secs: state.rate_limiter.retry_after(reset_at).as_secs(),
        }),
        Err(RateLimitError::Store(e)) => {
            error!(error = %e, "Rate limit store failed");
            Err(ApiError::Internal("rate limit store unavailable".to_string()))
        }
    }
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let (substances, jurisdictions, thresholds) = state.reference.snapshot().counts();
    Json(json!({
        "status": "ok",
        "queued_events": state.events_tx.len(),
        "reference": {
            "substances": substances,
            "jurisdictions": jurisdictions,
            "thresholds": thresholds,
        },
    }))
}

/// Serves the API until the shutdown signal flips to `true`.
pub struct ApiServer {
    listener: TcpListener,
    state: ApiState,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(listener: TcpListener, state: ApiState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            state,
            shutdown_rx,
        }
    }

    pub fn run(self) -> impl Future<Output = ()> {
        let ApiServer {
            listener,
            state,
            mut shutdown_rx,
        } = self;
        let app = router(state);
        async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                trace!("API server received shutdown signal.");
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "API server error");
            }
            trace!("API server task finished.");
        }
    }
}
