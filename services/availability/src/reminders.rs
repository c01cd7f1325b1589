//! Timed reminder jobs: pending -> sent/failed, with terminal failures and
//! age-based cleanup that never touches pending work.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use counselconnect_common::AppError;

use crate::batch::RunGuard;
use crate::models::{Booking, BookingRow, ReminderJob, ReminderJobRow, ReminderType};

const JOB_COLUMNS: &str =
    "id, booking_id, reminder_type, scheduled_at, sent_at, status, error_message";

pub const DEFAULT_RETENTION_DAYS: i64 = 3;

/// When a reminder of the given type fires for a session at `session_time`.
pub fn fire_time(session_time: DateTime<Utc>, reminder_type: ReminderType) -> DateTime<Utc> {
    session_time - reminder_type.lead_time()
}

/// Payload posted to the outbound notification endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ReminderDispatch {
    pub job_id: Uuid,
    pub booking_id: Uuid,
    pub counselor_id: Uuid,
    pub user_id: Uuid,
    pub reminder_type: ReminderType,
    pub session_time: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_reminder(&self, dispatch: &ReminderDispatch) -> Result<(), AppError>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_reminder(&self, dispatch: &ReminderDispatch) -> Result<(), AppError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(dispatch)
            .send()
            .await
            .map_err(|e| AppError::Dispatch(format!("notification request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Dispatch(format!(
                "notification endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReminderRunSummary {
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ReminderScheduler {
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
    retention: Duration,
    run_guard: RunGuard,
}

impl ReminderScheduler {
    pub fn new(pool: PgPool, notifier: Arc<dyn Notifier>, retention_days: i64) -> Self {
        Self {
            pool,
            notifier,
            retention: Duration::days(retention_days),
            run_guard: RunGuard::new(),
        }
    }

    /// Creates the 24h and 1h pending jobs for a booking. Fire times already
    /// in the past are skipped; existing jobs are left alone.
    pub async fn schedule_for_booking(&self, booking_id: Uuid) -> Result<Vec<ReminderJob>, AppError> {
        let booking = self.get_booking(booking_id).await?;
        let now = Utc::now();
        let mut created = Vec::new();

        for reminder_type in ReminderType::ALL {
            let due = fire_time(booking.scheduled_at, reminder_type);
            if due <= now {
                continue;
            }
            let query = format!(
                "INSERT INTO reminder_jobs (id, booking_id, reminder_type, scheduled_at, status) \
                 VALUES ($1, $2, $3, $4, 'pending') \
                 ON CONFLICT (booking_id, reminder_type) DO NOTHING \
                 RETURNING {}",
                JOB_COLUMNS
            );
            let row: Option<ReminderJobRow> = sqlx::query_as(&query)
                .bind(Uuid::new_v4())
                .bind(booking_id)
                .bind(reminder_type.to_string())
                .bind(due)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                created.push(row.try_into()?);
            }
        }

        tracing::info!(booking_id = %booking_id, created = created.len(), "reminder jobs scheduled");
        Ok(created)
    }

    /// Pending jobs whose fire time has passed, most urgent first.
    pub async fn get_pending_reminder_jobs(&self) -> Result<Vec<ReminderJob>, AppError> {
        let query = format!(
            "SELECT {} FROM reminder_jobs \
             WHERE status = 'pending' AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC",
            JOB_COLUMNS
        );
        let rows: Vec<ReminderJobRow> = sqlx::query_as(&query)
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ReminderJob::try_from).collect()
    }

    /// Dispatches every due job. A failure is terminal for that job and
    /// never aborts the rest of the batch; recovery is a manual re-run
    /// after the cause is fixed. Overlapping runs are rejected: the
    /// interval task and the admin endpoint would otherwise both fetch the
    /// same pending jobs and double-send them.
    pub async fn process_reminder_jobs(&self) -> Result<ReminderRunSummary, AppError> {
        let _guard = self.run_guard.try_acquire("reminder dispatch")?;

        let due = self.get_pending_reminder_jobs().await?;
        let mut summary = ReminderRunSummary::default();

        for job in due {
            summary.processed += 1;
            match self.dispatch(&job).await {
                Ok(()) => {
                    if self.mark_sent(job.id).await? {
                        summary.sent += 1;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    summary.errors.push(format!("job {}: {}", job.id, message));
                    if self.mark_failed(job.id, &message).await? {
                        summary.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            "reminder batch finished"
        );
        Ok(summary)
    }

    /// Deletes terminal jobs older than the retention window. Pending jobs
    /// are retained regardless of age.
    pub async fn cleanup_expired_reminder_jobs(&self) -> Result<u64, AppError> {
        let cutoff = Utc::now() - self.retention;
        let result = sqlx::query(
            "DELETE FROM reminder_jobs WHERE status <> 'pending' AND scheduled_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "expired reminder jobs removed");
        }
        Ok(deleted)
    }

    async fn dispatch(&self, job: &ReminderJob) -> Result<(), AppError> {
        let booking = self.get_booking(job.booking_id).await?;
        let dispatch = ReminderDispatch {
            job_id: job.id,
            booking_id: booking.id,
            counselor_id: booking.counselor_id,
            user_id: booking.user_id,
            reminder_type: job.reminder_type,
            session_time: booking.scheduled_at,
        };
        self.notifier.send_reminder(&dispatch).await
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        let row: BookingRow = sqlx::query_as(
            "SELECT id, counselor_id, user_id, scheduled_at, status FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("booking {} not found", booking_id)))?;
        row.try_into()
    }

    /// The status guard keeps a sent job immutable even if two runs race.
    async fn mark_sent(&self, job_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE reminder_jobs SET status = 'sent', sent_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, job_id: Uuid, message: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE reminder_jobs SET status = 'failed', error_message = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
