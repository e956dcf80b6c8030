//! Thin HTTP surface over the predictor service.
//!
//! Only the predictor's own entry points live here: log dispatch, refresh,
//! forecast reads, MORE/LESS feedback, product actions, and habit changes.
//! Feedback endpoints hand the predictor work to background tasks; the
//! response never depends on the dispatch result.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::errors::PantryError;
use crate::models::{Habit, HabitStatus};
use crate::predictor::service::PredictorService;
use crate::storage::PantryRepository;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PredictorService>,
    pub repo: Arc<dyn PantryRepository>,
}

pub struct ApiError(PantryError);

impl From<PantryError> for ApiError {
    fn from(err: PantryError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_bad_request() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/predictor/process-log/:log_id", post(process_log))
        .route("/api/predictor/refresh/:user_id", post(refresh_user))
        .route(
            "/api/predictor/forecast/:user_id/:product_id",
            get(latest_forecast),
        )
        .route("/api/inventory/:product_id/feedback", post(product_feedback))
        .route("/api/inventory/:product_id/action", post(product_action))
        .route("/api/habits", post(create_habit))
        .route("/api/habits/:habit_id", delete(remove_habit))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn process_log(
    State(state): State<AppState>,
    Path(log_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.service.process_inventory_log(log_id, None)?;
    Ok(Json(json!({ "message": "Log processed", "log_id": log_id })))
}

async fn refresh_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.service.refresh_user(user_id)?;
    Ok(Json(
        json!({ "message": "Forecasts refreshed", "user_id": user_id }),
    ))
}

async fn latest_forecast(
    State(state): State<AppState>,
    Path((user_id, product_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    match state
        .repo
        .latest_forecast(user_id, product_id)
        .map_err(PantryError::from)?
    {
        Some(row) => Ok(Json(json!({
            "expected_days_left": row.expected_days_left,
            "predicted_state": row.predicted_state.as_str(),
            "confidence": row.confidence,
            "generated_at": row.generated_at.to_rfc3339(),
        }))),
        None => Ok(Json(json!({
            "expected_days_left": 0,
            "predicted_state": "UNKNOWN",
            "confidence": 0.0,
            "generated_at": Value::Null,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct FeedbackQuery {
    user_id: Uuid,
    direction: String,
}

async fn product_feedback(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Query(query): Query<FeedbackQuery>,
) -> Result<Json<Value>, ApiError> {
    let outcome =
        state
            .service
            .apply_more_less_feedback(query.user_id, product_id, &query.direction)?;
    Ok(Json(json!({
        "message": "Feedback applied",
        "log_id": outcome.log_id,
        "days_left": outcome.days_left,
        "state": outcome.state.as_str(),
        "confidence": outcome.confidence,
    })))
}

#[derive(Debug, Deserialize)]
struct ProductActionRequest {
    user_id: Uuid,
    action_type: String,
    reason: String,
    #[serde(default)]
    custom_reason: Option<String>,
}

async fn product_action(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(req): Json<ProductActionRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.service.record_product_action(
        req.user_id,
        product_id,
        &req.action_type,
        &req.reason,
        req.custom_reason.as_deref(),
    )?;

    // Predictor update runs in the background; failures are logged and the
    // log row stays behind for a retry.
    let service = state.service.clone();
    let log_id = outcome.log.log_id;
    let state_before = outcome.state_before;
    tokio::task::spawn_blocking(move || {
        if let Err(e) = service.process_inventory_log(log_id, Some(state_before)) {
            warn!("background dispatch of log {} failed: {}", log_id, e);
        }
    });

    Ok(Json(json!({
        "message": "Action recorded",
        "log_id": log_id,
        "action": outcome.log.action.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
struct CreateHabitRequest {
    user_id: Uuid,
    #[serde(default)]
    status: Option<String>,
    effects: Value,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
}

async fn create_habit(
    State(state): State<AppState>,
    Json(req): Json<CreateHabitRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = req
        .status
        .as_deref()
        .and_then(HabitStatus::from_str)
        .unwrap_or(HabitStatus::Active);

    let habit = Habit {
        habit_id: Uuid::new_v4(),
        user_id: req.user_id,
        status,
        effects: req.effects,
        start_date: req.start_date,
        end_date: req.end_date,
    };
    state.service.create_habit(&habit)?;

    Ok(Json(json!({
        "habit_id": habit.habit_id,
        "status": habit.status.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteHabitQuery {
    user_id: Uuid,
}

async fn remove_habit(
    State(state): State<AppState>,
    Path(habit_id): Path<Uuid>,
    Query(query): Query<DeleteHabitQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.service.remove_habit(query.user_id, habit_id)? {
        Ok((
            StatusCode::OK,
            Json(json!({ "message": "Habit deleted", "habit_id": habit_id })),
        ))
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "habit not found" })),
        ))
    }
}
