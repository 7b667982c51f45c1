//! Admin-gated HTTP sync endpoint for Konf.

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use konf_core::SyncReport;
use konf_storage::{IdentityProvider, SheetKey, SyncStore};
use konf_sync::SyncPipeline;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "konf-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub pipeline: Arc<SyncPipeline>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(sync_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub sheets_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    results: SyncReport,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Unauthorized(error) => (StatusCode::UNAUTHORIZED, error),
            ApiError::Forbidden(error) => (StatusCode::FORBIDDEN, error),
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            ApiError::NotFound(error) => (StatusCode::NOT_FOUND, error),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        let body = Json(ErrorResponse {
            success: false,
            error,
        });
        (status, body).into_response()
    }
}

/// Kick off a sync for one event. Guards run in a fixed order: bearer token,
/// admin role, then request validation; the body is only inspected once the
/// caller is authorized.
async fn sync_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    let user_id = match state.identity.verify_token(token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            return Err(ApiError::Unauthorized(
                "invalid or expired token".to_string(),
            ))
        }
        Err(err) => {
            warn!(error = %err, "identity provider unavailable");
            return Err(ApiError::Unauthorized(
                "token verification failed".to_string(),
            ));
        }
    };

    let is_admin = state
        .store
        .is_admin(user_id)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if !is_admin {
        return Err(ApiError::Forbidden("admin access required".to_string()));
    }

    let Json(request) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let event_id = request
        .event_id
        .as_deref()
        .and_then(parse_event_id)
        .ok_or_else(|| ApiError::BadRequest("eventId must be a UUID".to_string()))?;

    let key = request
        .sheets_url
        .as_deref()
        .and_then(SheetKey::from_share_url)
        .ok_or_else(|| {
            ApiError::BadRequest("sheetsUrl is not a Google Sheets share link".to_string())
        })?;

    let event = state
        .store
        .event_by_id(event_id)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .ok_or_else(|| ApiError::NotFound("event not found".to_string()))?;

    info!(event_id = %event.id, slug = %event.slug, "sync requested");
    let results = state.pipeline.sync_event(event.id, &key).await;

    Ok(Json(SyncResponse {
        success: true,
        results,
        timestamp: Utc::now(),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Accepts only the canonical hyphenated UUID form. `Uuid::parse_str` alone
/// would also take the 32-char simple and braced forms.
fn parse_event_id(raw: &str) -> Option<Uuid> {
    if raw.len() != 36 {
        return None;
    }
    Uuid::parse_str(raw).ok()
}
