//! Projected view of counselor slots, derived from independently fetched
//! slot and booking rows and kept current by the realtime reconciler.
//!
//! Bookings carry only a timestamp, not a slot foreign key, so slots and
//! bookings are associated by tolerance matching: a booking occupies the
//! slot whose start lies within `BOOKING_MATCH_TOLERANCE` of its
//! `scheduled_at`. Two same-counselor slots starting inside one tolerance
//! window are ambiguous; the earliest-sorted slot wins.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Booking, ScheduleRow, Slot, SlotPatch};

pub const BOOKING_MATCH_TOLERANCE_SECS: i64 = 60;

pub fn booking_match_tolerance() -> Duration {
    Duration::seconds(BOOKING_MATCH_TOLERANCE_SECS)
}

fn within_tolerance(scheduled_at: DateTime<Utc>, slot_start: DateTime<Utc>, tolerance: Duration) -> bool {
    (scheduled_at - slot_start).num_seconds().abs() < tolerance.num_seconds()
}

/// Derives booked state for a window of slots from the bookings fetched for
/// the same window. Slot and booking rows are loaded independently; this is
/// the only place they meet.
pub fn project(rows: Vec<ScheduleRow>, bookings: &[Booking], tolerance: Duration) -> Vec<Slot> {
    let mut slots: Vec<Slot> = rows.into_iter().map(Slot::unbooked).collect();
    slots.sort_by_key(|s| (s.date, s.start_time));

    for slot in &mut slots {
        let slot_start = slot.starts_at();
        let matched = bookings.iter().find(|b| {
            b.counselor_id == slot.counselor_id
                && b.status.occupies_slot()
                && within_tolerance(b.scheduled_at, slot_start, tolerance)
        });
        if let Some(booking) = matched {
            slot.is_booked = true;
            slot.booking_id = Some(booking.id);
        }
    }

    slots
}

/// The local projected slot state for one engine instance.
///
/// Mutation is single-timeline: the reconciler loop applies feed events in
/// arrival order, optimistic operations mutate ahead of confirmation, and
/// seeding replaces the whole view. Fetches are tagged with a generation so
/// a slower, earlier-issued fetch cannot overwrite a later one.
#[derive(Debug, Default)]
pub struct ScheduleProjection {
    slots: Vec<Slot>,
    seed_generation: u64,
    tolerance: Option<Duration>,
}

impl ScheduleProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(tolerance: Duration) -> Self {
        Self {
            slots: Vec::new(),
            seed_generation: 0,
            tolerance: Some(tolerance),
        }
    }

    fn tolerance(&self) -> Duration {
        self.tolerance.unwrap_or_else(booking_match_tolerance)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Replaces the projection with a freshly fetched window. Returns false
    /// (and leaves the state untouched) when the fetch is staler than the
    /// last applied seed.
    pub fn seed(&mut self, generation: u64, slots: Vec<Slot>) -> bool {
        if generation < self.seed_generation {
            return false;
        }
        self.seed_generation = generation;
        self.slots = slots;
        self.sort();
        true
    }

    fn sort(&mut self) {
        self.slots.sort_by_key(|s| (s.date, s.start_time));
    }

    // Feed application. Events for one stream arrive strictly in order; no
    // ordering holds across the schedule and booking streams.

    pub fn apply_schedule_insert(&mut self, row: ScheduleRow) {
        if self.slots.iter().any(|s| s.id == row.id) {
            return;
        }
        self.slots.push(Slot::unbooked(row));
        self.sort();
    }

    /// Replaces schedule fields in place. Does not recompute
    /// `is_booked`/`booking_id`; a moved slot keeps its booked mark until
    /// the next refetch.
    pub fn apply_schedule_update(&mut self, row: &ScheduleRow) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == row.id) {
            slot.counselor_id = row.counselor_id;
            slot.date = row.date;
            slot.start_time = row.start_time;
            slot.end_time = row.end_time;
            slot.is_available = row.is_available;
            slot.recurring_weekly = row.recurring_weekly;
        }
        self.sort();
    }

    pub fn apply_schedule_delete(&mut self, id: Uuid) {
        self.slots.retain(|s| s.id != id);
    }

    /// A booking insert arriving before its slot exists locally is a silent
    /// no-op; the gap closes on the next refetch.
    pub fn apply_booking_insert(&mut self, booking: &Booking) {
        if !booking.status.occupies_slot() {
            return;
        }
        self.mark_booked(booking);
    }

    pub fn apply_booking_update(&mut self, booking: &Booking) {
        if booking.status.occupies_slot() {
            // A confirmation may be the first event we see for this booking.
            self.mark_booked(booking);
        } else {
            self.clear_booking(booking.id);
        }
    }

    pub fn apply_booking_delete(&mut self, booking_id: Uuid) {
        self.clear_booking(booking_id);
    }

    fn mark_booked(&mut self, booking: &Booking) {
        if self.slots.iter().any(|s| s.booking_id == Some(booking.id)) {
            return;
        }
        let tolerance = self.tolerance();
        let slot = self.slots.iter_mut().find(|s| {
            s.counselor_id == booking.counselor_id
                && !s.is_booked
                && within_tolerance(booking.scheduled_at, s.date.and_time(s.start_time).and_utc(), tolerance)
        });
        if let Some(slot) = slot {
            slot.is_booked = true;
            slot.booking_id = Some(booking.id);
        } else {
            tracing::debug!(booking_id = %booking.id, "no local slot matched booking event");
        }
    }

    fn clear_booking(&mut self, booking_id: Uuid) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.booking_id == Some(booking_id)) {
            slot.is_booked = false;
            slot.booking_id = None;
        }
    }

    // Optimistic layer: speculative local mutations applied ahead of server
    // confirmation. No rollback or timeout; divergence persists until the
    // next real event or refetch.

    pub fn optimistic_update_slot(&mut self, id: Uuid, patch: &SlotPatch) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        if let Some(date) = patch.date {
            slot.date = date;
        }
        if let Some(start_time) = patch.start_time {
            slot.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            slot.end_time = end_time;
        }
        if let Some(is_available) = patch.is_available {
            slot.is_available = is_available;
        }
        if let Some(recurring_weekly) = patch.recurring_weekly {
            slot.recurring_weekly = recurring_weekly;
        }
        self.sort();
        true
    }

    pub fn optimistic_add_booking(&mut self, slot_id: Uuid, booking_id: Uuid) -> bool {
        match self.slots.iter_mut().find(|s| s.id == slot_id) {
            Some(slot) => {
                slot.is_booked = true;
                slot.booking_id = Some(booking_id);
                true
            }
            None => false,
        }
    }

    pub fn optimistic_cancel_booking(&mut self, slot_id: Uuid) -> bool {
        match self.slots.iter_mut().find(|s| s.id == slot_id) {
            Some(slot) => {
                slot.is_booked = false;
                slot.booking_id = None;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookingStatus;
    use chrono::{NaiveDate, NaiveTime};

    fn row(counselor: Uuid, date: (i32, u32, u32), start: (u32, u32)) -> ScheduleRow {
        ScheduleRow {
            id: Uuid::new_v4(),
            counselor_id: counselor,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(start.0 + 1, start.1, 0).unwrap(),
            is_available: true,
            recurring_weekly: false,
        }
    }

    fn booking(counselor: Uuid, at: &str, status: BookingStatus) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            counselor_id: counselor,
            user_id: Uuid::new_v4(),
            scheduled_at: at.parse().unwrap(),
            status,
        }
    }

    #[test]
    fn booking_within_tolerance_marks_slot() {
        // Counselor with 09:00 and 10:00 slots; a confirmed booking at
        // 09:00:30 occupies only the 09:00 slot.
        let counselor = Uuid::new_v4();
        let nine = row(counselor, (2025, 7, 27), (9, 0));
        let ten = row(counselor, (2025, 7, 27), (10, 0));
        let b = booking(counselor, "2025-07-27T09:00:30Z", BookingStatus::Confirmed);

        let slots = project(vec![ten, nine], &[b.clone()], booking_match_tolerance());

        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert!(slots[0].is_booked);
        assert_eq!(slots[0].booking_id, Some(b.id));
        assert!(!slots[1].is_booked);
        assert_eq!(slots[1].booking_id, None);
    }

    #[test]
    fn booking_exactly_sixty_seconds_away_does_not_match() {
        let counselor = Uuid::new_v4();
        let nine = row(counselor, (2025, 7, 27), (9, 0));
        let b = booking(counselor, "2025-07-27T09:01:00Z", BookingStatus::Confirmed);

        let slots = project(vec![nine], &[b], booking_match_tolerance());
        assert!(!slots[0].is_booked);
    }

    #[test]
    fn cancelled_and_completed_bookings_do_not_occupy() {
        let counselor = Uuid::new_v4();
        let slots = project(
            vec![row(counselor, (2025, 7, 27), (9, 0))],
            &[
                booking(counselor, "2025-07-27T09:00:00Z", BookingStatus::Cancelled),
                booking(counselor, "2025-07-27T09:00:10Z", BookingStatus::Completed),
            ],
            booking_match_tolerance(),
        );
        assert!(!slots[0].is_booked);
    }

    #[test]
    fn other_counselors_bookings_are_ignored() {
        let counselor = Uuid::new_v4();
        let b = booking(Uuid::new_v4(), "2025-07-27T09:00:00Z", BookingStatus::Confirmed);
        let slots = project(vec![row(counselor, (2025, 7, 27), (9, 0))], &[b], booking_match_tolerance());
        assert!(!slots[0].is_booked);
    }

    #[test]
    fn ambiguous_near_simultaneous_slots_resolve_to_earliest() {
        // Two slots 30s apart both fall inside the tolerance window; the
        // earliest-sorted one takes the booking.
        let counselor = Uuid::new_v4();
        let mut early = row(counselor, (2025, 7, 27), (9, 0));
        early.start_time = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let mut late = row(counselor, (2025, 7, 27), (9, 0));
        late.start_time = NaiveTime::from_hms_opt(9, 0, 30).unwrap();
        let b = booking(counselor, "2025-07-27T09:00:15Z", BookingStatus::Pending);

        let slots = project(vec![late, early], &[b.clone()], booking_match_tolerance());
        assert!(slots[0].is_booked);
        assert_eq!(slots[0].booking_id, Some(b.id));
        assert!(!slots[1].is_booked);
    }

    #[test]
    fn projection_sorted_by_date_then_start() {
        let counselor = Uuid::new_v4();
        let slots = project(
            vec![
                row(counselor, (2025, 7, 28), (9, 0)),
                row(counselor, (2025, 7, 27), (14, 0)),
                row(counselor, (2025, 7, 27), (9, 0)),
            ],
            &[],
            booking_match_tolerance(),
        );
        let order: Vec<_> = slots.iter().map(|s| (s.date, s.start_time)).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn schedule_insert_then_delete_leaves_nothing() {
        let mut proj = ScheduleProjection::new();
        let r = row(Uuid::new_v4(), (2025, 7, 27), (9, 0));
        let id = r.id;
        let unrelated = row(Uuid::new_v4(), (2025, 7, 27), (10, 0));
        let unrelated_id = unrelated.id;

        proj.apply_schedule_insert(unrelated);
        proj.apply_schedule_insert(r);
        assert_eq!(proj.slots().len(), 2);

        proj.apply_schedule_delete(id);
        assert!(proj.slots().iter().all(|s| s.id != id));
        // Unrelated entry untouched.
        assert_eq!(proj.slots().len(), 1);
        assert_eq!(proj.slots()[0].id, unrelated_id);
    }

    #[test]
    fn delete_of_unknown_id_is_noop() {
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(row(Uuid::new_v4(), (2025, 7, 27), (9, 0)));
        proj.apply_schedule_delete(Uuid::new_v4());
        assert_eq!(proj.slots().len(), 1);
    }

    #[test]
    fn schedule_update_preserves_booked_state() {
        let counselor = Uuid::new_v4();
        let r = row(counselor, (2025, 7, 27), (9, 0));
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(r.clone());

        let b = booking(counselor, "2025-07-27T09:00:00Z", BookingStatus::Confirmed);
        proj.apply_booking_insert(&b);
        assert!(proj.slots()[0].is_booked);

        let mut moved = r;
        moved.is_available = false;
        proj.apply_schedule_update(&moved);

        // Known limitation: schedule updates do not recompute booked state.
        assert!(!proj.slots()[0].is_available);
        assert!(proj.slots()[0].is_booked);
        assert_eq!(proj.slots()[0].booking_id, Some(b.id));
    }

    #[test]
    fn booking_cancel_clears_slot_without_refetch() {
        let counselor = Uuid::new_v4();
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(row(counselor, (2025, 7, 27), (9, 0)));

        let mut b = booking(counselor, "2025-07-27T09:00:30Z", BookingStatus::Confirmed);
        proj.apply_booking_insert(&b);
        assert!(proj.slots()[0].is_booked);

        b.status = BookingStatus::Cancelled;
        proj.apply_booking_update(&b);
        assert!(!proj.slots()[0].is_booked);
        assert_eq!(proj.slots()[0].booking_id, None);
    }

    #[test]
    fn booking_delete_clears_by_booking_id() {
        let counselor = Uuid::new_v4();
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(row(counselor, (2025, 7, 27), (9, 0)));

        let b = booking(counselor, "2025-07-27T09:00:00Z", BookingStatus::Pending);
        proj.apply_booking_insert(&b);
        proj.apply_booking_delete(b.id);
        assert!(!proj.slots()[0].is_booked);
    }

    #[test]
    fn booking_insert_before_slot_exists_is_silent_noop() {
        // Cross-stream ordering gap: the booking stream can outrun the
        // schedule stream. The event is dropped, not deferred.
        let counselor = Uuid::new_v4();
        let mut proj = ScheduleProjection::new();
        let b = booking(counselor, "2025-07-27T09:00:00Z", BookingStatus::Confirmed);
        proj.apply_booking_insert(&b);
        assert!(proj.slots().is_empty());

        // The slot arriving afterwards stays unbooked until refetch.
        proj.apply_schedule_insert(row(counselor, (2025, 7, 27), (9, 0)));
        assert!(!proj.slots()[0].is_booked);
    }

    #[test]
    fn duplicate_booking_events_are_idempotent() {
        let counselor = Uuid::new_v4();
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(row(counselor, (2025, 7, 27), (9, 0)));
        proj.apply_schedule_insert(row(counselor, (2025, 7, 27), (10, 0)));

        let b = booking(counselor, "2025-07-27T09:00:00Z", BookingStatus::Pending);
        proj.apply_booking_insert(&b);
        proj.apply_booking_insert(&b);
        proj.apply_booking_update(&b);

        let booked: Vec<_> = proj.slots().iter().filter(|s| s.is_booked).collect();
        assert_eq!(booked.len(), 1);
    }

    #[test]
    fn stale_seed_is_discarded() {
        let mut proj = ScheduleProjection::new();
        let fresh = vec![Slot::unbooked(row(Uuid::new_v4(), (2025, 7, 27), (9, 0)))];
        assert!(proj.seed(2, fresh.clone()));

        // An earlier-issued fetch completing late must not win.
        let stale = vec![
            Slot::unbooked(row(Uuid::new_v4(), (2025, 7, 27), (10, 0))),
            Slot::unbooked(row(Uuid::new_v4(), (2025, 7, 27), (11, 0))),
        ];
        assert!(!proj.seed(1, stale));
        assert_eq!(proj.slots().len(), 1);
        assert_eq!(proj.slots()[0].id, fresh[0].id);
    }

    #[test]
    fn reseeding_prunes_slots_outside_the_new_window() {
        let mut proj = ScheduleProjection::new();
        let past = Slot::unbooked(row(Uuid::new_v4(), (2025, 7, 20), (9, 0)));
        let past_id = past.id;
        assert!(proj.seed(1, vec![past]));

        // The window rolled forward; the refreshed fetch no longer covers
        // the past day, so its slots must not survive the reseed.
        let current = Slot::unbooked(row(Uuid::new_v4(), (2025, 7, 27), (9, 0)));
        let current_id = current.id;
        assert!(proj.seed(2, vec![current]));

        assert_eq!(proj.slots().len(), 1);
        assert!(proj.slots().iter().all(|s| s.id != past_id));
        assert_eq!(proj.slots()[0].id, current_id);
    }

    #[test]
    fn optimistic_ops_mutate_immediately() {
        let counselor = Uuid::new_v4();
        let r = row(counselor, (2025, 7, 27), (9, 0));
        let slot_id = r.id;
        let mut proj = ScheduleProjection::new();
        proj.apply_schedule_insert(r);

        let booking_id = Uuid::new_v4();
        assert!(proj.optimistic_add_booking(slot_id, booking_id));
        assert!(proj.slots()[0].is_booked);
        assert_eq!(proj.slots()[0].booking_id, Some(booking_id));

        assert!(proj.optimistic_cancel_booking(slot_id));
        assert!(!proj.slots()[0].is_booked);

        let patch = SlotPatch {
            is_available: Some(false),
            ..Default::default()
        };
        assert!(proj.optimistic_update_slot(slot_id, &patch));
        assert!(!proj.slots()[0].is_available);

        // Unknown slot ids report failure instead of corrupting state.
        assert!(!proj.optimistic_add_booking(Uuid::new_v4(), booking_id));
        assert!(!proj.optimistic_update_slot(Uuid::new_v4(), &patch));
    }
}
