//! Change-feed subscription over redis pub/sub.
//!
//! The backing store publishes one JSON envelope `{table, operation, old,
//! new}` per row mutation on a channel per table. Subscribing decodes the
//! envelopes into typed events and forwards them into two independent mpsc
//! queues, one per stream, drained by the reconciler loop. Ordering is
//! preserved within each stream only; nothing orders the two streams
//! against each other.

use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use counselconnect_common::{AppError, RedisConfig};

use crate::models::{Booking, BookingRow, ScheduleRow};

pub const SCHEDULE_CHANNEL: &str = "feed:schedules";
pub const BOOKING_CHANNEL: &str = "feed:bookings";

pub const SCHEDULE_TABLE: &str = "counselor_schedules";
pub const BOOKING_TABLE: &str = "bookings";

const FEED_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub table: String,
    pub operation: ChangeOp,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum ScheduleEvent {
    Inserted(ScheduleRow),
    Updated(ScheduleRow),
    Deleted(Uuid),
}

#[derive(Debug, Clone)]
pub enum BookingEvent {
    Inserted(Booking),
    Updated(Booking),
    Deleted(Uuid),
}

// Delete envelopes may carry a trimmed old row; only the id is required.
#[derive(Debug, Deserialize)]
struct DeletedRow {
    id: Uuid,
    #[serde(default)]
    counselor_id: Option<Uuid>,
}

fn required<'a>(value: &'a Option<serde_json::Value>, field: &str) -> Result<&'a serde_json::Value, AppError> {
    value
        .as_ref()
        .ok_or_else(|| AppError::Validation(format!("change envelope missing '{}' row", field)))
}

/// Decodes a schedule envelope, applying the optional counselor filter.
/// Filtered-out events decode to `None`.
pub fn decode_schedule_event(
    envelope: &ChangeEnvelope,
    counselor_filter: Option<Uuid>,
) -> Result<Option<ScheduleEvent>, AppError> {
    match envelope.operation {
        ChangeOp::Insert | ChangeOp::Update => {
            let row: ScheduleRow = serde_json::from_value(required(&envelope.new, "new")?.clone())
                .map_err(|e| AppError::Validation(format!("bad schedule row in feed event: {}", e)))?;
            if counselor_filter.is_some_and(|c| c != row.counselor_id) {
                return Ok(None);
            }
            Ok(Some(match envelope.operation {
                ChangeOp::Insert => ScheduleEvent::Inserted(row),
                _ => ScheduleEvent::Updated(row),
            }))
        }
        ChangeOp::Delete => {
            let old: DeletedRow = serde_json::from_value(required(&envelope.old, "old")?.clone())
                .map_err(|e| AppError::Validation(format!("bad schedule row in feed event: {}", e)))?;
            if counselor_filter.is_some() && old.counselor_id.is_some() && old.counselor_id != counselor_filter {
                return Ok(None);
            }
            Ok(Some(ScheduleEvent::Deleted(old.id)))
        }
    }
}

pub fn decode_booking_event(
    envelope: &ChangeEnvelope,
    counselor_filter: Option<Uuid>,
) -> Result<Option<BookingEvent>, AppError> {
    match envelope.operation {
        ChangeOp::Insert | ChangeOp::Update => {
            let row: BookingRow = serde_json::from_value(required(&envelope.new, "new")?.clone())
                .map_err(|e| AppError::Validation(format!("bad booking row in feed event: {}", e)))?;
            if counselor_filter.is_some_and(|c| c != row.counselor_id) {
                return Ok(None);
            }
            let booking: Booking = row.try_into()?;
            Ok(Some(match envelope.operation {
                ChangeOp::Insert => BookingEvent::Inserted(booking),
                _ => BookingEvent::Updated(booking),
            }))
        }
        ChangeOp::Delete => {
            let old: DeletedRow = serde_json::from_value(required(&envelope.old, "old")?.clone())
                .map_err(|e| AppError::Validation(format!("bad booking row in feed event: {}", e)))?;
            if counselor_filter.is_some() && old.counselor_id.is_some() && old.counselor_id != counselor_filter {
                return Ok(None);
            }
            Ok(Some(BookingEvent::Deleted(old.id)))
        }
    }
}

/// Handle for an active change-feed subscription. Dropping it aborts the
/// pump task, so a torn-down consumer never applies late events.
pub struct FeedSubscription {
    task: JoinHandle<()>,
}

impl FeedSubscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    client: redis::Client,
}

impl ChangeFeed {
    pub fn new(config: &RedisConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(config.connection_string())?;
        Ok(Self { client })
    }

    /// Subscribes to both change streams, optionally filtered by counselor.
    /// Returns the subscription handle plus one receiver per stream.
    pub async fn subscribe(
        &self,
        counselor_filter: Option<Uuid>,
    ) -> Result<(FeedSubscription, mpsc::Receiver<ScheduleEvent>, mpsc::Receiver<BookingEvent>), AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(SCHEDULE_CHANNEL).await?;
        pubsub.subscribe(BOOKING_CHANNEL).await?;

        let (schedule_tx, schedule_rx) = mpsc::channel(FEED_QUEUE_DEPTH);
        let (booking_tx, booking_rx) = mpsc::channel(FEED_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("unreadable feed payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if let Err(e) =
                    route_message(&channel, &payload, counselor_filter, &schedule_tx, &booking_tx).await
                {
                    tracing::warn!("change-feed event dropped: {}", e);
                }
            }
            tracing::info!("change-feed stream closed");
        });

        tracing::info!(
            "subscribed to change feed (filter: {})",
            counselor_filter.map_or_else(|| "none".to_string(), |c| c.to_string())
        );

        Ok((FeedSubscription { task }, schedule_rx, booking_rx))
    }

    // Publish half, used by the engine's own slot mutations so peer
    // instances converge without a refetch.

    pub async fn publish_schedule(
        &self,
        operation: ChangeOp,
        old: Option<&ScheduleRow>,
        new: Option<&ScheduleRow>,
    ) -> Result<(), AppError> {
        let envelope = ChangeEnvelope {
            table: SCHEDULE_TABLE.to_string(),
            operation,
            old: old.map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null)),
            new: new.map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null)),
        };
        self.publish(SCHEDULE_CHANNEL, &envelope).await
    }

    pub async fn publish_booking(
        &self,
        operation: ChangeOp,
        old: Option<&BookingRow>,
        new: Option<&BookingRow>,
    ) -> Result<(), AppError> {
        let envelope = ChangeEnvelope {
            table: BOOKING_TABLE.to_string(),
            operation,
            old: old.map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null)),
            new: new.map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null)),
        };
        self.publish(BOOKING_CHANNEL, &envelope).await
    }

    async fn publish(&self, channel: &str, envelope: &ChangeEnvelope) -> Result<(), AppError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| AppError::Internal(format!("failed to encode feed envelope: {}", e)))?;
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

async fn route_message(
    channel: &str,
    payload: &str,
    counselor_filter: Option<Uuid>,
    schedule_tx: &mpsc::Sender<ScheduleEvent>,
    booking_tx: &mpsc::Sender<BookingEvent>,
) -> Result<(), AppError> {
    let envelope: ChangeEnvelope = serde_json::from_str(payload)
        .map_err(|e| AppError::Validation(format!("bad change envelope: {}", e)))?;

    match channel {
        SCHEDULE_CHANNEL => {
            if let Some(event) = decode_schedule_event(&envelope, counselor_filter)? {
                schedule_tx
                    .send(event)
                    .await
                    .map_err(|_| AppError::Internal("schedule stream consumer gone".to_string()))?;
            }
        }
        BOOKING_CHANNEL => {
            if let Some(event) = decode_booking_event(&envelope, counselor_filter)? {
                booking_tx
                    .send(event)
                    .await
                    .map_err(|_| AppError::Internal("booking stream consumer gone".to_string()))?;
            }
        }
        other => {
            tracing::debug!("ignoring message on unexpected channel {}", other);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schedule_value(id: Uuid, counselor_id: Uuid) -> serde_json::Value {
        json!({
            "id": id,
            "counselor_id": counselor_id,
            "date": "2025-07-27",
            "start_time": "09:00:00",
            "end_time": "10:00:00",
            "is_available": true,
            "recurring_weekly": false,
        })
    }

    #[test]
    fn decodes_schedule_insert() {
        let id = Uuid::new_v4();
        let counselor = Uuid::new_v4();
        let envelope = ChangeEnvelope {
            table: SCHEDULE_TABLE.to_string(),
            operation: ChangeOp::Insert,
            old: None,
            new: Some(schedule_value(id, counselor)),
        };
        match decode_schedule_event(&envelope, None).unwrap() {
            Some(ScheduleEvent::Inserted(row)) => {
                assert_eq!(row.id, id);
                assert_eq!(row.counselor_id, counselor);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn decodes_schedule_delete_from_old_row() {
        let id = Uuid::new_v4();
        let envelope = ChangeEnvelope {
            table: SCHEDULE_TABLE.to_string(),
            operation: ChangeOp::Delete,
            old: Some(json!({ "id": id })),
            new: None,
        };
        match decode_schedule_event(&envelope, None).unwrap() {
            Some(ScheduleEvent::Deleted(deleted)) => assert_eq!(deleted, id),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn counselor_filter_drops_foreign_events() {
        let envelope = ChangeEnvelope {
            table: SCHEDULE_TABLE.to_string(),
            operation: ChangeOp::Insert,
            old: None,
            new: Some(schedule_value(Uuid::new_v4(), Uuid::new_v4())),
        };
        let filtered = decode_schedule_event(&envelope, Some(Uuid::new_v4())).unwrap();
        assert!(filtered.is_none());
    }

    #[test]
    fn decodes_booking_update_with_status() {
        let id = Uuid::new_v4();
        let envelope = ChangeEnvelope {
            table: BOOKING_TABLE.to_string(),
            operation: ChangeOp::Update,
            old: None,
            new: Some(json!({
                "id": id,
                "counselor_id": Uuid::new_v4(),
                "user_id": Uuid::new_v4(),
                "scheduled_at": "2025-07-27T09:00:00Z",
                "status": "cancelled",
            })),
        };
        match decode_booking_event(&envelope, None).unwrap() {
            Some(BookingEvent::Updated(b)) => {
                assert_eq!(b.id, id);
                assert_eq!(b.status, crate::models::BookingStatus::Cancelled);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn unknown_booking_status_is_an_error() {
        let envelope = ChangeEnvelope {
            table: BOOKING_TABLE.to_string(),
            operation: ChangeOp::Insert,
            old: None,
            new: Some(json!({
                "id": Uuid::new_v4(),
                "counselor_id": Uuid::new_v4(),
                "user_id": Uuid::new_v4(),
                "scheduled_at": "2025-07-27T09:00:00Z",
                "status": "archived",
            })),
        };
        assert!(decode_booking_event(&envelope, None).is_err());
    }

    #[test]
    fn missing_row_is_an_error() {
        let envelope = ChangeEnvelope {
            table: SCHEDULE_TABLE.to_string(),
            operation: ChangeOp::Insert,
            old: None,
            new: None,
        };
        assert!(decode_schedule_event(&envelope, None).is_err());
    }
}
