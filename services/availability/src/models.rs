use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use counselconnect_common::AppError;

// Booking status as written by the booking layer. Only pending/confirmed
// bookings count as occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn occupies_slot(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BookingStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(AppError::Validation(format!("unknown booking status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
    Missed,
}

impl SessionStatus {
    // Forward-only transition graph. Cancellation is reachable from
    // scheduled or active; missed only from scheduled.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Scheduled, Active)
                | (Scheduled, Cancelled)
                | (Scheduled, Missed)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Missed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Missed => "missed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "missed" => Ok(SessionStatus::Missed),
            other => Err(AppError::Validation(format!("unknown session status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderType {
    #[serde(rename = "24h")]
    TwentyFourHour,
    #[serde(rename = "1h")]
    OneHour,
}

impl ReminderType {
    pub const ALL: [ReminderType; 2] = [ReminderType::TwentyFourHour, ReminderType::OneHour];

    // How far ahead of the session this reminder fires.
    pub fn lead_time(self) -> chrono::Duration {
        match self {
            ReminderType::TwentyFourHour => chrono::Duration::hours(24),
            ReminderType::OneHour => chrono::Duration::hours(1),
        }
    }
}

impl fmt::Display for ReminderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReminderType::TwentyFourHour => "24h",
            ReminderType::OneHour => "1h",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ReminderType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(ReminderType::TwentyFourHour),
            "1h" => Ok(ReminderType::OneHour),
            other => Err(AppError::Validation(format!("unknown reminder type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Sent => "sent",
            ReminderStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ReminderStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReminderStatus::Pending),
            "sent" => Ok(ReminderStatus::Sent),
            "failed" => Ok(ReminderStatus::Failed),
            other => Err(AppError::Validation(format!("unknown reminder status: {}", other))),
        }
    }
}

// Database rows. Statuses persist as TEXT and are parsed into typed enums at
// the domain boundary.

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleRow {
    pub id: Uuid,
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_available: bool,
    pub recurring_weekly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookingRow {
    pub id: Uuid,
    pub counselor_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub counselor_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub status: String,
    pub auto_started: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReminderJobRow {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub reminder_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
}

// Domain types

/// A counselor-declared availability window with its projected booked state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_available: bool,
    pub recurring_weekly: bool,
    pub is_booked: bool,
    pub booking_id: Option<Uuid>,
}

impl Slot {
    pub fn unbooked(row: ScheduleRow) -> Self {
        Self {
            id: row.id,
            counselor_id: row.counselor_id,
            date: row.date,
            start_time: row.start_time,
            end_time: row.end_time,
            is_available: row.is_available,
            recurring_weekly: row.recurring_weekly,
            is_booked: false,
            booking_id: None,
        }
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.start_time).and_utc()
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.end_time).and_utc()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: Uuid,
    pub counselor_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub status: BookingStatus,
}

impl TryFrom<BookingRow> for Booking {
    type Error = AppError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            counselor_id: row.counselor_id,
            user_id: row.user_id,
            scheduled_at: row.scheduled_at,
            status: row.status.parse()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub counselor_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub auto_started: bool,
    pub notes: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            booking_id: row.booking_id,
            counselor_id: row.counselor_id,
            user_id: row.user_id,
            scheduled_start: row.scheduled_start,
            scheduled_end: row.scheduled_end,
            actual_start: row.actual_start,
            actual_end: row.actual_end,
            status: row.status.parse()?,
            auto_started: row.auto_started,
            notes: row.notes,
        })
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OnlineStatus {
    pub counselor_id: Uuid,
    pub is_online: bool,
    pub last_activity: DateTime<Utc>,
    pub auto_online_start: Option<DateTime<Utc>>,
    pub auto_online_end: Option<DateTime<Utc>>,
    pub manual_override: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReminderJob {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub reminder_type: ReminderType,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: ReminderStatus,
    pub error_message: Option<String>,
}

impl TryFrom<ReminderJobRow> for ReminderJob {
    type Error = AppError;

    fn try_from(row: ReminderJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            booking_id: row.booking_id,
            reminder_type: row.reminder_type.parse()?,
            scheduled_at: row.scheduled_at,
            sent_at: row.sent_at,
            status: row.status.parse()?,
            error_message: row.error_message,
        })
    }
}

// Request bodies

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSlotRequest {
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub recurring_weekly: bool,
}

fn default_true() -> bool {
    true
}

/// Partial slot update, also used as the optimistic patch applied to the
/// local projection ahead of confirmation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlotPatch {
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub is_available: Option<bool>,
    pub recurring_weekly: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSessionStatusRequest {
    pub status: SessionStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideStatusRequest {
    pub is_online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_status_occupancy() {
        assert!(BookingStatus::Pending.occupies_slot());
        assert!(BookingStatus::Confirmed.occupies_slot());
        assert!(!BookingStatus::Completed.occupies_slot());
        assert!(!BookingStatus::Cancelled.occupies_slot());
    }

    #[test]
    fn session_transitions_are_forward_only() {
        use SessionStatus::*;

        assert!(Scheduled.can_transition_to(Active));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(Scheduled.can_transition_to(Missed));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));

        // No backward or skipping moves.
        assert!(!Active.can_transition_to(Scheduled));
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Scheduled));
        assert!(!Missed.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(SessionStatus::Missed.is_terminal());
        assert!(!SessionStatus::Scheduled.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn reminder_type_round_trip() {
        for rt in ReminderType::ALL {
            let parsed: ReminderType = rt.to_string().parse().unwrap();
            assert_eq!(parsed, rt);
        }
        assert!("2h".parse::<ReminderType>().is_err());
    }

    #[test]
    fn reminder_lead_times() {
        assert_eq!(ReminderType::TwentyFourHour.lead_time(), chrono::Duration::hours(24));
        assert_eq!(ReminderType::OneHour.lead_time(), chrono::Duration::hours(1));
    }

    #[test]
    fn slot_start_combines_date_and_time() {
        let row = ScheduleRow {
            id: Uuid::new_v4(),
            counselor_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 7, 27).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            is_available: true,
            recurring_weekly: false,
        };
        let slot = Slot::unbooked(row);
        assert_eq!(slot.starts_at().to_rfc3339(), "2025-07-27T09:00:00+00:00");
        assert_eq!(slot.ends_at().to_rfc3339(), "2025-07-27T10:00:00+00:00");
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("archived".parse::<BookingStatus>().is_err());
        assert!("paused".parse::<SessionStatus>().is_err());
        assert!("done".parse::<ReminderStatus>().is_err());
    }
}
