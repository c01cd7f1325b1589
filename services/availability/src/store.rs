//! Window-scoped slot loading and the live schedule board.

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use counselconnect_common::AppError;

use crate::feed::{BookingEvent, ScheduleEvent};
use crate::models::{Booking, BookingRow, CreateSlotRequest, ScheduleRow, Slot, SlotPatch};
use crate::projection::{project, ScheduleProjection};

const SCHEDULE_COLUMNS: &str =
    "id, counselor_id, date, start_time, end_time, is_available, recurring_weekly";

#[derive(Clone)]
pub struct ScheduleStore {
    pool: PgPool,
    tolerance: Duration,
}

impl ScheduleStore {
    pub fn new(pool: PgPool, tolerance: Duration) -> Self {
        Self { pool, tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Loads slot rows and booking rows for the window independently (no
    /// join) and projects booked state onto the slots.
    pub async fn fetch_window(
        &self,
        counselor_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Slot>, AppError> {
        if end < start {
            return Err(AppError::Validation("window end precedes start".to_string()));
        }

        let rows: Vec<ScheduleRow> = match counselor_id {
            Some(cid) => {
                let query = format!(
                    "SELECT {} FROM counselor_schedules WHERE counselor_id = $1 AND date >= $2 AND date <= $3",
                    SCHEDULE_COLUMNS
                );
                sqlx::query_as(&query)
                    .bind(cid)
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM counselor_schedules WHERE date >= $1 AND date <= $2",
                    SCHEDULE_COLUMNS
                );
                sqlx::query_as(&query)
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        // Pad the booking window by the tolerance so edge bookings still match.
        let window_start = start.and_time(NaiveTime::MIN).and_utc() - self.tolerance;
        let window_end = end.and_time(NaiveTime::MIN).and_utc() + Duration::days(1) + self.tolerance;

        let booking_rows: Vec<BookingRow> = match counselor_id {
            Some(cid) => {
                sqlx::query_as(
                    "SELECT id, counselor_id, user_id, scheduled_at, status FROM bookings \
                     WHERE counselor_id = $1 AND scheduled_at >= $2 AND scheduled_at < $3",
                )
                .bind(cid)
                .bind(window_start)
                .bind(window_end)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, counselor_id, user_id, scheduled_at, status FROM bookings \
                     WHERE scheduled_at >= $1 AND scheduled_at < $2",
                )
                .bind(window_start)
                .bind(window_end)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let bookings = booking_rows
            .into_iter()
            .map(Booking::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(project(rows, &bookings, self.tolerance))
    }

    pub async fn get_slot_row(&self, id: Uuid) -> Result<ScheduleRow, AppError> {
        let query = format!("SELECT {} FROM counselor_schedules WHERE id = $1", SCHEDULE_COLUMNS);
        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("slot {} not found", id)))
    }

    pub async fn insert_slot(&self, request: &CreateSlotRequest) -> Result<ScheduleRow, AppError> {
        if request.start_time >= request.end_time {
            return Err(AppError::Validation("slot start must precede end".to_string()));
        }

        let query = format!(
            "INSERT INTO counselor_schedules \
             (id, counselor_id, date, start_time, end_time, is_available, recurring_weekly) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
            SCHEDULE_COLUMNS
        );
        let row = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(request.counselor_id)
            .bind(request.date)
            .bind(request.start_time)
            .bind(request.end_time)
            .bind(request.is_available)
            .bind(request.recurring_weekly)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_slot(&self, id: Uuid, patch: &SlotPatch) -> Result<ScheduleRow, AppError> {
        if let (Some(start), Some(end)) = (patch.start_time, patch.end_time) {
            if start >= end {
                return Err(AppError::Validation("slot start must precede end".to_string()));
            }
        }

        let query = format!(
            "UPDATE counselor_schedules SET \
             date = COALESCE($2::date, date), \
             start_time = COALESCE($3::time, start_time), \
             end_time = COALESCE($4::time, end_time), \
             is_available = COALESCE($5::boolean, is_available), \
             recurring_weekly = COALESCE($6::boolean, recurring_weekly), \
             updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            SCHEDULE_COLUMNS
        );
        sqlx::query_as(&query)
            .bind(id)
            .bind(patch.date)
            .bind(patch.start_time)
            .bind(patch.end_time)
            .bind(patch.is_available)
            .bind(patch.recurring_weekly)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("slot {} not found", id)))
    }

    pub async fn delete_slot(&self, id: Uuid) -> Result<ScheduleRow, AppError> {
        let query = format!("DELETE FROM counselor_schedules WHERE id = $1 RETURNING {}", SCHEDULE_COLUMNS);
        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("slot {} not found", id)))
    }
}

/// The engine's live projected window: a rolling horizon of slots kept
/// current by the reconciler and mutated optimistically by slot handlers.
#[derive(Clone)]
pub struct ScheduleBoard {
    store: ScheduleStore,
    projection: Arc<RwLock<ScheduleProjection>>,
    fetch_generation: Arc<AtomicU64>,
    horizon_days: i64,
}

impl ScheduleBoard {
    pub fn new(store: ScheduleStore, horizon_days: i64) -> Self {
        let tolerance = store.tolerance();
        Self {
            store,
            projection: Arc::new(RwLock::new(ScheduleProjection::with_tolerance(tolerance))),
            fetch_generation: Arc::new(AtomicU64::new(0)),
            horizon_days,
        }
    }

    /// Shared handle for the reconciler loop.
    pub fn projection(&self) -> Arc<RwLock<ScheduleProjection>> {
        Arc::clone(&self.projection)
    }

    pub fn window_bounds(&self) -> (NaiveDate, NaiveDate) {
        let today = Utc::now().date_naive();
        (today, today + Duration::days(self.horizon_days))
    }

    pub fn covers(&self, start: NaiveDate, end: NaiveDate) -> bool {
        let (board_start, board_end) = self.window_bounds();
        start >= board_start && end <= board_end
    }

    /// Refetches the board window. Each refetch carries a generation; a
    /// slower fetch issued earlier loses to one that already completed.
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let generation = self.fetch_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (start, end) = self.window_bounds();
        let slots = self.store.fetch_window(None, start, end).await?;

        let mut projection = self.projection.write().await;
        if !projection.seed(generation, slots) {
            tracing::debug!(generation, "discarded stale refetch result");
        }
        Ok(projection.slots().len())
    }

    pub async fn snapshot(
        &self,
        counselor_id: Option<Uuid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Slot> {
        let projection = self.projection.read().await;
        projection
            .slots()
            .iter()
            .filter(|s| s.date >= start && s.date <= end)
            .filter(|s| counselor_id.map_or(true, |c| s.counselor_id == c))
            .cloned()
            .collect()
    }

    pub async fn apply_schedule(&self, event: ScheduleEvent) {
        let mut projection = self.projection.write().await;
        match event {
            ScheduleEvent::Inserted(row) => projection.apply_schedule_insert(row),
            ScheduleEvent::Updated(row) => projection.apply_schedule_update(&row),
            ScheduleEvent::Deleted(id) => projection.apply_schedule_delete(id),
        }
    }

    pub async fn apply_booking(&self, event: BookingEvent) {
        let mut projection = self.projection.write().await;
        match event {
            BookingEvent::Inserted(booking) => projection.apply_booking_insert(&booking),
            BookingEvent::Updated(booking) => projection.apply_booking_update(&booking),
            BookingEvent::Deleted(id) => projection.apply_booking_delete(id),
        }
    }

    pub async fn optimistic_update_slot(&self, id: Uuid, patch: &SlotPatch) -> bool {
        self.projection.write().await.optimistic_update_slot(id, patch)
    }

    pub async fn optimistic_add_booking(&self, slot_id: Uuid, booking_id: Uuid) -> bool {
        self.projection.write().await.optimistic_add_booking(slot_id, booking_id)
    }

    pub async fn optimistic_cancel_booking(&self, slot_id: Uuid) -> bool {
        self.projection.write().await.optimistic_cancel_booking(slot_id)
    }
}
