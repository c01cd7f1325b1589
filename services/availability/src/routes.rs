use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Projected schedule window and slot mutations
        .route("/schedule/slots", get(handlers::get_slots))
        .route("/schedule/slots", post(handlers::create_slot))
        .route("/schedule/slots/:slot_id", put(handlers::update_slot))
        .route("/schedule/slots/:slot_id", delete(handlers::delete_slot))
        .route("/schedule/refresh", post(handlers::refresh_board))
        // Session lifecycle
        .route("/sessions/:session_id", get(handlers::get_session))
        .route("/sessions/:session_id/status", put(handlers::update_session_status))
        .route("/counselors/:counselor_id/sessions", get(handlers::list_counselor_sessions))
        // Online status
        .route("/counselors/:counselor_id/status", get(handlers::get_online_status))
        .route("/counselors/:counselor_id/status/override", put(handlers::set_status_override))
        .route("/counselors/:counselor_id/status/override", delete(handlers::clear_status_override))
        // Reminder jobs
        .route("/bookings/:booking_id/reminders", post(handlers::schedule_booking_reminders))
        .route("/reminders/pending", get(handlers::list_pending_reminders))
        // Batch entry points
        .route("/admin/process-auto-status", post(handlers::process_auto_status))
        .route("/admin/process-reminders", post(handlers::process_reminders))
        .route("/admin/cleanup-reminders", post(handlers::cleanup_reminders))
}
