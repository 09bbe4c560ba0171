use dashmap::DashMap;
use ulid::Ulid;

/// Lookup tables kept beside the slot map. Every entry is derived from
/// committed events and updated only while the owning slot's lock is held.
#[derive(Default)]
pub struct Index {
    /// booking id → slot id
    booking_slot: DashMap<Ulid, Ulid>,
    /// student id → booking ids, any status
    student_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// tutor id → slot ids
    tutor_slots: DashMap<Ulid, Vec<Ulid>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn add_booking(&self, booking_id: Ulid, slot_id: Ulid, student_id: Ulid) {
        self.booking_slot.insert(booking_id, slot_id);
        self.student_bookings
            .entry(student_id)
            .or_default()
            .push(booking_id);
    }

    pub fn remove_booking(&self, booking_id: &Ulid, student_id: &Ulid) {
        self.booking_slot.remove(booking_id);
        if let Some(mut ids) = self.student_bookings.get_mut(student_id) {
            ids.retain(|b| b != booking_id);
        }
    }

    /// `(booking id, slot id)` for every booking the student ever made.
    pub fn bookings_of(&self, student_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        let ids = self
            .student_bookings
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|b| self.slot_for_booking(&b).map(|s| (b, s)))
            .collect()
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn add_slot(&self, tutor_id: Ulid, slot_id: Ulid) {
        self.tutor_slots.entry(tutor_id).or_default().push(slot_id);
    }

    pub fn remove_slot(&self, tutor_id: &Ulid, slot_id: &Ulid) {
        if let Some(mut ids) = self.tutor_slots.get_mut(tutor_id) {
            ids.retain(|s| s != slot_id);
        }
    }

    pub fn slots_of(&self, tutor_id: &Ulid) -> Vec<Ulid> {
        self.tutor_slots
            .get(tutor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
