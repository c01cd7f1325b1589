//! Counselor online/offline status.
//!
//! Automatic mode derives `is_online` from whether now falls inside any
//! available slot today; a manual override freezes the value until cleared.
//! `process_auto_online_status` is the periodic batch that also advances
//! session lifecycles whose windows have opened or elapsed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use counselconnect_common::AppError;

use crate::batch::RunGuard;
use crate::lifecycle::SessionLifecycle;
use crate::models::{OnlineStatus, ScheduleRow, SessionStatus, Slot};

const STATUS_COLUMNS: &str =
    "counselor_id, is_online, last_activity, auto_online_start, auto_online_end, manual_override";

/// Result of one batch run, for operator visibility.
#[derive(Debug, Default, Serialize)]
pub struct AutoStatusSummary {
    pub online_changed: u32,
    pub sessions_started: u32,
    pub sessions_completed: u32,
    pub sessions_missed: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoWindow {
    pub is_online: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Derives the automatic online state from today's slots: online iff now is
/// inside an available slot; start/end bound today's available windows.
pub fn auto_online_window(slots: &[Slot], now: DateTime<Utc>) -> AutoWindow {
    let today = now.date_naive();
    let todays: Vec<&Slot> = slots
        .iter()
        .filter(|s| s.is_available && s.date == today)
        .collect();

    let is_online = todays
        .iter()
        .any(|s| s.starts_at() <= now && now < s.ends_at());
    let start = todays.iter().map(|s| s.starts_at()).min();
    let end = todays.iter().map(|s| s.ends_at()).max();

    AutoWindow { is_online, start, end }
}

#[derive(Clone)]
pub struct OnlineStatusController {
    pool: PgPool,
    lifecycle: SessionLifecycle,
    run_guard: RunGuard,
}

impl OnlineStatusController {
    pub fn new(pool: PgPool, lifecycle: SessionLifecycle) -> Self {
        Self {
            pool,
            lifecycle,
            run_guard: RunGuard::new(),
        }
    }

    pub async fn get_status(&self, counselor_id: Uuid) -> Result<OnlineStatus, AppError> {
        let query = format!("SELECT {} FROM counselor_status WHERE counselor_id = $1", STATUS_COLUMNS);
        sqlx::query_as(&query)
            .bind(counselor_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no online status for counselor {}", counselor_id)))
    }

    /// Freezes the online flag until the override is cleared.
    pub async fn set_manual_override(&self, counselor_id: Uuid, is_online: bool) -> Result<OnlineStatus, AppError> {
        let query = format!(
            "INSERT INTO counselor_status (counselor_id, is_online, last_activity, manual_override, updated_at) \
             VALUES ($1, $2, NOW(), TRUE, NOW()) \
             ON CONFLICT (counselor_id) DO UPDATE SET \
             is_online = EXCLUDED.is_online, manual_override = TRUE, \
             last_activity = NOW(), updated_at = NOW() \
             RETURNING {}",
            STATUS_COLUMNS
        );
        let status: OnlineStatus = sqlx::query_as(&query)
            .bind(counselor_id)
            .bind(is_online)
            .fetch_one(&self.pool)
            .await?;
        tracing::info!(counselor_id = %counselor_id, is_online, "manual status override set");
        Ok(status)
    }

    /// Returns control to automatic computation on the next evaluation.
    pub async fn clear_manual_override(&self, counselor_id: Uuid) -> Result<OnlineStatus, AppError> {
        let query = format!(
            "UPDATE counselor_status SET manual_override = FALSE, updated_at = NOW() \
             WHERE counselor_id = $1 RETURNING {}",
            STATUS_COLUMNS
        );
        sqlx::query_as(&query)
            .bind(counselor_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no online status for counselor {}", counselor_id)))
    }

    /// The periodic batch. Idempotent: an immediate re-run reports zero
    /// additional changes. Overlapping runs are rejected rather than
    /// interleaved.
    pub async fn process_auto_online_status(&self) -> Result<AutoStatusSummary, AppError> {
        let _guard = self.run_guard.try_acquire("auto status")?;

        let now = Utc::now();
        let today = now.date_naive();
        let mut summary = AutoStatusSummary::default();

        // (a) recompute online state for counselors with schedules today.
        let counselor_ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT DISTINCT counselor_id FROM counselor_schedules WHERE date = $1")
                .bind(today)
                .fetch_all(&self.pool)
                .await?;

        for (counselor_id,) in counselor_ids {
            match self.refresh_auto_status(counselor_id, now).await {
                Ok(true) => summary.online_changed += 1,
                Ok(false) => {}
                Err(e) => summary.errors.push(format!("status {}: {}", counselor_id, e)),
            }
        }

        // Counselors with no schedule rows today fall back offline.
        match self.expire_stale_online(today).await {
            Ok(n) => summary.online_changed += n,
            Err(e) => summary.errors.push(format!("status expiry: {}", e)),
        }

        // (b) auto-start sessions whose window has begun.
        self.advance_sessions(
            "SELECT id FROM chat_sessions WHERE status = 'scheduled' \
             AND scheduled_start <= $1 AND scheduled_end > $1",
            SessionStatus::Active,
            now,
            &mut summary.sessions_started,
            &mut summary.errors,
        )
        .await?;

        // (c) complete sessions whose window has fully elapsed.
        self.advance_sessions(
            "SELECT id FROM chat_sessions WHERE status = 'active' AND scheduled_end <= $1",
            SessionStatus::Completed,
            now,
            &mut summary.sessions_completed,
            &mut summary.errors,
        )
        .await?;

        // Scheduled sessions that never started and whose window elapsed are
        // missed.
        self.advance_sessions(
            "SELECT id FROM chat_sessions WHERE status = 'scheduled' AND scheduled_end <= $1",
            SessionStatus::Missed,
            now,
            &mut summary.sessions_missed,
            &mut summary.errors,
        )
        .await?;

        tracing::info!(
            online_changed = summary.online_changed,
            sessions_started = summary.sessions_started,
            sessions_completed = summary.sessions_completed,
            sessions_missed = summary.sessions_missed,
            errors = summary.errors.len(),
            "auto status batch finished"
        );
        Ok(summary)
    }

    /// Returns true when the counselor's online flag actually flipped.
    async fn refresh_auto_status(&self, counselor_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT id, counselor_id, date, start_time, end_time, is_available, recurring_weekly \
             FROM counselor_schedules WHERE counselor_id = $1 AND date = $2",
        )
        .bind(counselor_id)
        .bind(now.date_naive())
        .fetch_all(&self.pool)
        .await?;

        let slots: Vec<Slot> = rows.into_iter().map(Slot::unbooked).collect();
        let window = auto_online_window(&slots, now);

        let prior: Option<OnlineStatus> = {
            let query = format!("SELECT {} FROM counselor_status WHERE counselor_id = $1", STATUS_COLUMNS);
            sqlx::query_as(&query)
                .bind(counselor_id)
                .fetch_optional(&self.pool)
                .await?
        };

        if prior.as_ref().is_some_and(|p| p.manual_override) {
            return Ok(false);
        }
        let changed = prior.as_ref().map_or(false, |p| p.is_online) != window.is_online;

        let query = "INSERT INTO counselor_status \
             (counselor_id, is_online, last_activity, auto_online_start, auto_online_end, manual_override, updated_at) \
             VALUES ($1, $2, NOW(), $3, $4, FALSE, NOW()) \
             ON CONFLICT (counselor_id) DO UPDATE SET \
             is_online = EXCLUDED.is_online, \
             auto_online_start = EXCLUDED.auto_online_start, \
             auto_online_end = EXCLUDED.auto_online_end, \
             last_activity = CASE WHEN counselor_status.is_online <> EXCLUDED.is_online \
                 THEN NOW() ELSE counselor_status.last_activity END, \
             updated_at = NOW() \
             WHERE counselor_status.manual_override = FALSE";
        sqlx::query(query)
            .bind(counselor_id)
            .bind(window.is_online)
            .bind(window.start)
            .bind(window.end)
            .execute(&self.pool)
            .await?;

        Ok(changed)
    }

    async fn expire_stale_online(&self, today: chrono::NaiveDate) -> Result<u32, AppError> {
        let result = sqlx::query(
            "UPDATE counselor_status SET is_online = FALSE, \
             auto_online_start = NULL, auto_online_end = NULL, \
             last_activity = NOW(), updated_at = NOW() \
             WHERE manual_override = FALSE AND is_online = TRUE \
             AND counselor_id NOT IN \
               (SELECT DISTINCT counselor_id FROM counselor_schedules WHERE date = $1)",
        )
        .bind(today)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    async fn advance_sessions(
        &self,
        select_due: &str,
        target: SessionStatus,
        now: DateTime<Utc>,
        counter: &mut u32,
        errors: &mut Vec<String>,
    ) -> Result<(), AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(select_due).bind(now).fetch_all(&self.pool).await?;
        for (session_id,) in ids {
            match self.lifecycle.auto_transition(session_id, target).await {
                Ok(_) => *counter += 1,
                Err(e) => errors.push(format!("session {}: {}", session_id, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn slot(date: NaiveDate, start: (u32, u32), end: (u32, u32), available: bool) -> Slot {
        Slot {
            id: Uuid::new_v4(),
            counselor_id: Uuid::new_v4(),
            date,
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            is_available: available,
            recurring_weekly: false,
            is_booked: false,
            booking_id: None,
        }
    }

    #[test]
    fn online_inside_available_slot() {
        // Available 14:00-15:00, now 14:30 -> online.
        let now: DateTime<Utc> = "2025-07-27T14:30:00Z".parse().unwrap();
        let today = now.date_naive();
        let window = auto_online_window(&[slot(today, (14, 0), (15, 0), true)], now);
        assert!(window.is_online);
        assert_eq!(window.start, Some("2025-07-27T14:00:00Z".parse().unwrap()));
        assert_eq!(window.end, Some("2025-07-27T15:00:00Z".parse().unwrap()));
    }

    #[test]
    fn offline_outside_window() {
        let now: DateTime<Utc> = "2025-07-27T15:30:00Z".parse().unwrap();
        let today = now.date_naive();
        let window = auto_online_window(&[slot(today, (14, 0), (15, 0), true)], now);
        assert!(!window.is_online);
        // The bounding window is still reported.
        assert!(window.start.is_some());
    }

    #[test]
    fn unavailable_slots_do_not_count() {
        let now: DateTime<Utc> = "2025-07-27T14:30:00Z".parse().unwrap();
        let today = now.date_naive();
        let window = auto_online_window(&[slot(today, (14, 0), (15, 0), false)], now);
        assert!(!window.is_online);
        assert_eq!(window.start, None);
        assert_eq!(window.end, None);
    }

    #[test]
    fn other_days_slots_are_ignored() {
        let now: DateTime<Utc> = "2025-07-27T14:30:00Z".parse().unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2025, 7, 28).unwrap();
        let window = auto_online_window(&[slot(tomorrow, (14, 0), (15, 0), true)], now);
        assert!(!window.is_online);
        assert_eq!(window.start, None);
    }

    #[test]
    fn bounding_window_spans_disjoint_slots() {
        let now: DateTime<Utc> = "2025-07-27T12:00:00Z".parse().unwrap();
        let today = now.date_naive();
        let window = auto_online_window(
            &[
                slot(today, (9, 0), (10, 0), true),
                slot(today, (14, 0), (15, 0), true),
            ],
            now,
        );
        // Noon sits in the gap: offline, but bounded by the day's slots.
        assert!(!window.is_online);
        assert_eq!(window.start, Some("2025-07-27T09:00:00Z".parse().unwrap()));
        assert_eq!(window.end, Some("2025-07-27T15:00:00Z".parse().unwrap()));
    }

    #[test]
    fn slot_end_is_exclusive() {
        let now: DateTime<Utc> = "2025-07-27T15:00:00Z".parse().unwrap();
        let today = now.date_naive();
        let window = auto_online_window(&[slot(today, (14, 0), (15, 0), true)], now);
        assert!(!window.is_online);
    }

    async fn test_pool() -> Option<PgPool> {
        // Skip test if no database is available
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("Skipping database test - DATABASE_URL not set");
                return None;
            }
        };
        let pool = PgPool::connect(&url).await.expect("failed to connect to test database");
        counselconnect_database::run_migrations(&pool)
            .await
            .expect("failed to run migrations");
        Some(pool)
    }

    #[tokio::test]
    async fn auto_status_batch_is_idempotent() {
        let Some(pool) = test_pool().await else { return };
        let controller = OnlineStatusController::new(pool.clone(), SessionLifecycle::new(pool.clone()));

        let counselor = Uuid::new_v4();
        let now = Utc::now();

        // An all-day available slot, so "now" is inside it whatever the
        // wall clock says.
        sqlx::query(
            "INSERT INTO counselor_schedules \
             (id, counselor_id, date, start_time, end_time, is_available, recurring_weekly) \
             VALUES ($1, $2, $3, $4, $5, TRUE, FALSE)",
        )
        .bind(Uuid::new_v4())
        .bind(counselor)
        .bind(now.date_naive())
        .bind(chrono::NaiveTime::MIN)
        .bind(chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap())
        .execute(&pool)
        .await
        .expect("failed to insert schedule");

        let booking_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO bookings (id, counselor_id, user_id, scheduled_at, status) \
             VALUES ($1, $2, $3, $4, 'confirmed')",
        )
        .bind(booking_id)
        .bind(counselor)
        .bind(Uuid::new_v4())
        .bind(now)
        .execute(&pool)
        .await
        .expect("failed to insert booking");

        let session_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO chat_sessions \
             (id, booking_id, counselor_id, user_id, scheduled_start, scheduled_end, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'scheduled')",
        )
        .bind(session_id)
        .bind(booking_id)
        .bind(counselor)
        .bind(Uuid::new_v4())
        .bind(now - chrono::Duration::minutes(5))
        .bind(now + chrono::Duration::minutes(25))
        .execute(&pool)
        .await
        .expect("failed to insert session");

        let first = controller
            .process_auto_online_status()
            .await
            .expect("first batch run failed");
        assert!(first.sessions_started >= 1);

        let status = controller.get_status(counselor).await.expect("no status row");
        assert!(status.is_online);
        assert!(!status.manual_override);

        let (session_status, auto_started): (String, bool) =
            sqlx::query_as("SELECT status, auto_started FROM chat_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_one(&pool)
                .await
                .expect("failed to query session");
        assert_eq!(session_status, "active");
        assert!(auto_started);

        // An immediate re-run reports zero additional changes.
        let second = controller
            .process_auto_online_status()
            .await
            .expect("second batch run failed");
        assert_eq!(second.online_changed, 0);
        assert_eq!(second.sessions_started, 0);
        assert_eq!(second.sessions_completed, 0);
        assert_eq!(second.sessions_missed, 0);
    }
}
