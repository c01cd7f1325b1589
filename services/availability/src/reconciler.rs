//! Drains the two change-feed queues and applies events to the projection.
//!
//! Ingestion (the feed pump) is decoupled from state application: this loop
//! is the only writer applying feed events, so events are applied strictly
//! in arrival order within each stream. The two streams race each other by
//! design; a booking event can observe a world where its slot does not
//! exist yet.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::feed::{BookingEvent, ScheduleEvent};
use crate::projection::ScheduleProjection;

pub struct Reconciler {
    projection: Arc<RwLock<ScheduleProjection>>,
    schedule_rx: mpsc::Receiver<ScheduleEvent>,
    booking_rx: mpsc::Receiver<BookingEvent>,
}

impl Reconciler {
    pub fn new(
        projection: Arc<RwLock<ScheduleProjection>>,
        schedule_rx: mpsc::Receiver<ScheduleEvent>,
        booking_rx: mpsc::Receiver<BookingEvent>,
    ) -> Self {
        Self {
            projection,
            schedule_rx,
            booking_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        // Both streams are drained to closure; a closed channel must not
        // strand events still queued on the other one.
        let mut schedule_open = true;
        let mut booking_open = true;
        while schedule_open || booking_open {
            tokio::select! {
                maybe_event = self.schedule_rx.recv(), if schedule_open => match maybe_event {
                    Some(event) => self.apply_schedule(event).await,
                    None => schedule_open = false,
                },
                maybe_event = self.booking_rx.recv(), if booking_open => match maybe_event {
                    Some(event) => self.apply_booking(event).await,
                    None => booking_open = false,
                },
            }
        }
        tracing::info!("reconciler loop stopped");
    }

    async fn apply_schedule(&self, event: ScheduleEvent) {
        let mut projection = self.projection.write().await;
        match event {
            ScheduleEvent::Inserted(row) => {
                tracing::debug!(slot_id = %row.id, "feed: schedule insert");
                projection.apply_schedule_insert(row);
            }
            ScheduleEvent::Updated(row) => {
                tracing::debug!(slot_id = %row.id, "feed: schedule update");
                projection.apply_schedule_update(&row);
            }
            ScheduleEvent::Deleted(id) => {
                tracing::debug!(slot_id = %id, "feed: schedule delete");
                projection.apply_schedule_delete(id);
            }
        }
    }

    async fn apply_booking(&self, event: BookingEvent) {
        let mut projection = self.projection.write().await;
        match event {
            BookingEvent::Inserted(booking) => {
                tracing::debug!(booking_id = %booking.id, "feed: booking insert");
                projection.apply_booking_insert(&booking);
            }
            BookingEvent::Updated(booking) => {
                tracing::debug!(booking_id = %booking.id, "feed: booking update");
                projection.apply_booking_update(&booking);
            }
            BookingEvent::Deleted(id) => {
                tracing::debug!(booking_id = %id, "feed: booking delete");
                projection.apply_booking_delete(id);
            }
        }
    }
}
