//! Main axum router and request dispatch for the caching proxy.
//!
//! Routes:
//! - `GET  /<repo>[.git]/info/refs?service=git-upload-pack` - ref advertisement
//! - `POST /<repo>[.git]/git-upload-pack`                    - pack negotiation
//! - `GET  /healthz`                                         - health check
//! - `GET  /metrics`                                         - Prometheus metrics
//!
//! Repository paths have any number of segments, so Git requests are taken
//! by the fallback handler and classified by [`resolve`].  Everything it does
//! not recognise, pushes included, is a 404.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, Span};

use crate::cache::CacheError;
use crate::identity::{resolve, Phase, Rejection};
use crate::metrics::PhaseLabels;
use crate::AppState;

use super::auth::client_user;
use super::bridge::{decode_request_body, BodyError, BridgeError, ProxySession, RequestInput};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Serve one smart-HTTP request from the local mirror, creating or
/// refreshing the mirror first when needed.
#[instrument(
    skip_all,
    fields(
        %method,
        path = %uri.path(),
        identity = tracing::field::Empty,
        phase = tracing::field::Empty,
        user = tracing::field::Empty,
    )
)]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let (identity, phase) = resolve(&uri, &method)?;
    let user = client_user(&headers);

    let span = Span::current();
    span.record("identity", identity.as_str());
    span.record("phase", phase.as_str());
    if let Some(user) = &user {
        span.record("user", user.as_str());
    }

    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&PhaseLabels::new(phase))
        .inc();

    let input = match phase {
        Phase::Advertise => RequestInput::Empty,
        Phase::Negotiate => {
            decode_request_body(&headers, body, state.config.upload_pack.max_request_body).await?
        }
    };

    let upstream_url = state.cache.upstream_url(&identity);
    let prepared = state.cache.prepare(&identity, &upstream_url, phase).await?;
    debug!(status = ?prepared.status, path = %prepared.path.display(), "mirror ready");

    let session = ProxySession {
        identity,
        phase,
        user,
    };
    let body = state.bridge.serve(session, &prepared.path, input).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, phase.content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        cache_root: state.config.storage.cache_root.clone(),
        upload_pack_program: state.config.upload_pack.program.clone().into(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Unified error type for HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Not a request this proxy serves.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Body(#[from] BodyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// An unexpected internal error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Rejected(_) => StatusCode::NOT_FOUND,
            Self::Body(BodyError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Body(BodyError::UnsupportedEncoding(_)) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Body(BodyError::Unreadable(_)) => StatusCode::BAD_REQUEST,
            Self::Cache(_) | Self::Bridge(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Client mistakes, not system errors.
            Self::Rejected(reason) => {
                debug!(%reason, "request rejected");
                "Not Found".to_string()
            }
            Self::Body(err) => {
                info!(error = %err, "request body refused");
                err.to_string()
            }
            err => {
                error!(error = %err, "request failed");
                format!("Internal server error: {err}")
            }
        };

        let mut response = (status, message).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
