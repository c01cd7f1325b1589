use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use counselconnect_common::{ApiResponse, AppError};

use crate::feed::{ChangeOp, ScheduleEvent};
use crate::models::{
    CreateSlotRequest, OnlineStatus, OverrideStatusRequest, ReminderJob, Session, Slot, SlotPatch,
    UpdateSessionStatusRequest,
};
use crate::presence::AutoStatusSummary;
use crate::reminders::ReminderRunSummary;
use crate::AppState;

/// Axum-facing error wrapper; `AppError` lives in the shared crate and
/// cannot implement `IntoResponse` there.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SlotWindowQuery {
    pub counselor_id: Option<Uuid>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct SessionWindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub async fn health_check() -> ApiResult<String> {
    Ok(Json(ApiResponse::success("Availability service is healthy".to_string())))
}

// Schedule window and slot mutations

pub async fn get_slots(
    State(state): State<AppState>,
    Query(query): Query<SlotWindowQuery>,
) -> ApiResult<Vec<Slot>> {
    // Serve from the live board when the asked-for window is inside it;
    // wider windows fall back to a direct store fetch.
    let slots = if state.board.covers(query.start, query.end) {
        state.board.snapshot(query.counselor_id, query.start, query.end).await
    } else {
        state
            .store
            .fetch_window(query.counselor_id, query.start, query.end)
            .await?
    };
    Ok(Json(ApiResponse::success(slots)))
}

pub async fn create_slot(
    State(state): State<AppState>,
    Json(request): Json<CreateSlotRequest>,
) -> ApiResult<Slot> {
    let row = state.store.insert_slot(&request).await?;

    // Apply locally ahead of the feed echo, then tell peers.
    state.board.apply_schedule(ScheduleEvent::Inserted(row.clone())).await;
    if let Err(e) = state.feed.publish_schedule(ChangeOp::Insert, None, Some(&row)).await {
        tracing::warn!("feed publish failed after slot insert: {}", e);
    }

    Ok(Json(ApiResponse::success(Slot::unbooked(row))))
}

pub async fn update_slot(
    State(state): State<AppState>,
    Path(slot_id): Path<Uuid>,
    Json(patch): Json<SlotPatch>,
) -> ApiResult<Slot> {
    let old = state.store.get_slot_row(slot_id).await?;
    let row = state.store.update_slot(slot_id, &patch).await?;

    state.board.optimistic_update_slot(slot_id, &patch).await;
    if let Err(e) = state.feed.publish_schedule(ChangeOp::Update, Some(&old), Some(&row)).await {
        tracing::warn!("feed publish failed after slot update: {}", e);
    }

    Ok(Json(ApiResponse::success(Slot::unbooked(row))))
}

pub async fn delete_slot(
    State(state): State<AppState>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<Uuid> {
    let old = state.store.delete_slot(slot_id).await?;

    state.board.apply_schedule(ScheduleEvent::Deleted(slot_id)).await;
    if let Err(e) = state.feed.publish_schedule(ChangeOp::Delete, Some(&old), None).await {
        tracing::warn!("feed publish failed after slot delete: {}", e);
    }

    Ok(Json(ApiResponse::success(slot_id)))
}

pub async fn refresh_board(State(state): State<AppState>) -> ApiResult<usize> {
    let count = state.board.refresh().await?;
    Ok(Json(ApiResponse::success(count)))
}

// Sessions

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Session> {
    let session = state.lifecycle.get_session(session_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn list_counselor_sessions(
    State(state): State<AppState>,
    Path(counselor_id): Path<Uuid>,
    Query(query): Query<SessionWindowQuery>,
) -> ApiResult<Vec<Session>> {
    let sessions = state
        .lifecycle
        .sessions_for_counselor(counselor_id, query.start, query.end)
        .await?;
    Ok(Json(ApiResponse::success(sessions)))
}

pub async fn update_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<UpdateSessionStatusRequest>,
) -> ApiResult<Session> {
    let session = state
        .lifecycle
        .update_session_status(session_id, request.status, request.notes)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

// Online status

pub async fn get_online_status(
    State(state): State<AppState>,
    Path(counselor_id): Path<Uuid>,
) -> ApiResult<OnlineStatus> {
    let status = state.presence.get_status(counselor_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn set_status_override(
    State(state): State<AppState>,
    Path(counselor_id): Path<Uuid>,
    Json(request): Json<OverrideStatusRequest>,
) -> ApiResult<OnlineStatus> {
    let status = state
        .presence
        .set_manual_override(counselor_id, request.is_online)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn clear_status_override(
    State(state): State<AppState>,
    Path(counselor_id): Path<Uuid>,
) -> ApiResult<OnlineStatus> {
    let status = state.presence.clear_manual_override(counselor_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

// Reminders

pub async fn schedule_booking_reminders(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Vec<ReminderJob>> {
    let jobs = state.reminders.schedule_for_booking(booking_id).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn list_pending_reminders(State(state): State<AppState>) -> ApiResult<Vec<ReminderJob>> {
    let jobs = state.reminders.get_pending_reminder_jobs().await?;
    Ok(Json(ApiResponse::success(jobs)))
}

// Batch entry points

pub async fn process_auto_status(State(state): State<AppState>) -> ApiResult<AutoStatusSummary> {
    let summary = state.presence.process_auto_online_status().await?;
    Ok(Json(ApiResponse::success(summary)))
}

pub async fn process_reminders(State(state): State<AppState>) -> ApiResult<ReminderRunSummary> {
    let summary = state.reminders.process_reminder_jobs().await?;
    Ok(Json(ApiResponse::success(summary)))
}

pub async fn cleanup_reminders(State(state): State<AppState>) -> ApiResult<u64> {
    let deleted = state.reminders.cleanup_expired_reminder_jobs().await?;
    Ok(Json(ApiResponse::success(deleted)))
}
