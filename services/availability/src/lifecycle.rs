//! Session lifecycle: scheduled -> active -> completed, with cancellation
//! reachable from scheduled or active and missed from scheduled. The
//! transition graph is enforced here; an illegal move is a Conflict, not a
//! silent write.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use counselconnect_common::AppError;

use crate::models::{Session, SessionRow, SessionStatus};

const SESSION_COLUMNS: &str = "id, booking_id, counselor_id, user_id, scheduled_start, \
     scheduled_end, actual_start, actual_end, status, auto_started, notes";

#[derive(Clone)]
pub struct SessionLifecycle {
    pool: PgPool,
}

impl SessionLifecycle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session, AppError> {
        let query = format!("SELECT {} FROM chat_sessions WHERE id = $1", SESSION_COLUMNS);
        let row: SessionRow = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {} not found", id)))?;
        row.try_into()
    }

    pub async fn sessions_for_counselor(
        &self,
        counselor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let query = format!(
            "SELECT {} FROM chat_sessions \
             WHERE counselor_id = $1 AND scheduled_start >= $2 AND scheduled_start < $3 \
             ORDER BY scheduled_start",
            SESSION_COLUMNS
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(counselor_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    /// User/counselor-driven status change.
    pub async fn update_session_status(
        &self,
        id: Uuid,
        new_status: SessionStatus,
        notes: Option<String>,
    ) -> Result<Session, AppError> {
        self.transition(id, new_status, notes, false).await
    }

    /// Automation-driven change; entering active marks the session
    /// auto-started.
    pub async fn auto_transition(&self, id: Uuid, new_status: SessionStatus) -> Result<Session, AppError> {
        self.transition(id, new_status, None, true).await
    }

    async fn transition(
        &self,
        id: Uuid,
        new_status: SessionStatus,
        notes: Option<String>,
        auto: bool,
    ) -> Result<Session, AppError> {
        let current = self.get_session(id).await?;
        if !current.status.can_transition_to(new_status) {
            return Err(AppError::Conflict(format!(
                "illegal session transition {} -> {}",
                current.status, new_status
            )));
        }

        let now = Utc::now();
        let actual_start = match new_status {
            SessionStatus::Active => Some(now),
            _ => None,
        };
        let actual_end = if new_status.is_terminal() { Some(now) } else { None };
        let auto_started = auto && new_status == SessionStatus::Active;

        // The status guard in the WHERE clause closes the race with a
        // concurrent transition between our read and this write.
        let query = format!(
            "UPDATE chat_sessions SET \
             status = $3, \
             actual_start = COALESCE($4, actual_start), \
             actual_end = COALESCE($5, actual_end), \
             auto_started = auto_started OR $6, \
             notes = COALESCE($7, notes), \
             updated_at = $8 \
             WHERE id = $1 AND status = $2 RETURNING {}",
            SESSION_COLUMNS
        );
        let row: SessionRow = sqlx::query_as(&query)
            .bind(id)
            .bind(current.status.to_string())
            .bind(new_status.to_string())
            .bind(actual_start)
            .bind(actual_end)
            .bind(auto_started)
            .bind(notes)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("session {} changed concurrently, transition not applied", id))
            })?;

        tracing::info!(
            session_id = %id,
            from = %current.status,
            to = %new_status,
            auto,
            "session transition applied"
        );
        row.try_into()
    }
}
