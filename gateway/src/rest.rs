use crate::auth::AuthResult;
use crate::identity::Role;
use crate::model::{MonitoringPrincipal, TelemetryResponse};
use crate::session::SessionManager;
use crate::telemetry::{TelemetryFilter, TelemetryStore};
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    telemetry: Arc<dyn TelemetryStore>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryQuery {
    device_id: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn create_router(manager: Arc<SessionManager>, telemetry: Arc<dyn TelemetryStore>) -> Router {
    let state = AppState { manager, telemetry };

    Router::new()
        .route("/api/v1/telemetry", get(get_telemetry))
        .route("/api/v1/telemetry/sensor/:id", get(get_sensor_telemetry))
        .with_state(state)
}

/// Only dashboard principals may read history.
async fn require_dashboard(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<MonitoringPrincipal, AppError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
        .ok_or(AppError::Unauthorized)?;

    match state
        .manager
        .authenticator()
        .authenticate_as(token, Role::Dashboard)
        .await
    {
        AuthResult::Dashboard(user) => Ok(user),
        AuthResult::Rejected(reason) => {
            debug!("REST request rejected: {}", reason);
            Err(AppError::Unauthorized)
        }
        AuthResult::Sensor(_) => Err(AppError::Unauthorized),
    }
}

async fn get_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TelemetryQuery>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let user = require_dashboard(&state, &headers).await?;

    let mut filter = TelemetryFilter::new(params.limit, params.offset);
    filter.device_id = params.device_id;
    filter.start = params.start;
    filter.end = params.end;

    debug!(user = %user.username, ?filter, "Telemetry query");
    let telemetry = state.telemetry.query(&filter).await?;
    let total = state.telemetry.count(&filter).await?;

    Ok(Json(TelemetryResponse {
        data: telemetry,
        total,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

async fn get_sensor_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sensor_id): Path<i64>,
    Query(params): Query<PageQuery>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let user = require_dashboard(&state, &headers).await?;

    let mut filter = TelemetryFilter::new(params.limit, params.offset);
    filter.device_id = Some(sensor_id);

    debug!(user = %user.username, sensor_id, "Sensor history query");
    let telemetry = state.telemetry.query(&filter).await?;
    let total = state.telemetry.count(&filter).await?;

    Ok(Json(TelemetryResponse {
        data: telemetry,
        total,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

enum AppError {
    Unauthorized,
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            AppError::Internal(err) => {
                error!("API error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", err),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
