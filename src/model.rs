use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Tutor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Tutor => "tutor",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "tutor" => Some(Role::Tutor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<SlotStatus> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Some(SlotStatus::Available),
            "booked" => Some(SlotStatus::Booked),
            "cancelled" => Some(SlotStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub subject: String,
    pub description: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub capacity: u32,
    pub booked_count: u32,
    pub status: SlotStatus,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }

    /// Open for a new booking at `now`.
    pub fn is_bookable(&self, now: Ms) -> bool {
        self.status == SlotStatus::Available
            && self.booked_count < self.capacity
            && self.start_time > now
    }

    /// Status implied by the seat count, unless the slot is already void.
    pub fn derived_status(&self) -> SlotStatus {
        if self.status == SlotStatus::Cancelled {
            SlotStatus::Cancelled
        } else if self.booked_count >= self.capacity {
            SlotStatus::Booked
        } else {
            SlotStatus::Available
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub student_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A slot row together with its booking rows. One lock guards both, so the
/// slot-then-bookings lock order is a single acquisition.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    /// Every booking ever made on this slot, in creation order.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn confirmed_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_confirmed()).count()
    }

    /// True if any row exists for this student, whatever its status.
    pub fn has_booking_for(&self, student_id: Ulid) -> bool {
        self.bookings.iter().any(|b| b.student_id == student_id)
    }

    pub fn confirmed_students(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.bookings
            .iter()
            .filter(|b| b.is_confirmed())
            .map(|b| b.student_id)
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub subject: String,
    pub description: Option<String>,
    pub start_time: Ms,
    pub end_time: Ms,
    pub capacity: Option<u32>,
}

/// Partial slot update. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub capacity: Option<u32>,
    pub status: Option<SlotStatus>,
}

impl SlotPatch {
    pub fn is_empty(&self) -> bool {
        *self == SlotPatch::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotFilter {
    /// Calendar date of `start_time` in the engine's local offset.
    pub date: Option<chrono::NaiveDate>,
    /// Case-insensitive substring of the subject.
    pub subject: Option<String>,
    pub tutor_id: Option<Ulid>,
}

/// The event types, flat with no nesting. This is the WAL record format.
/// One committed transaction is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    SlotCreated {
        slot: Slot,
    },
    /// After-image of a tutor edit.
    SlotUpdated {
        slot: Slot,
    },
    SlotDeleted {
        id: Ulid,
        tutor_id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        cancelled_at: Ms,
    },
    /// Full slot image written by WAL compaction.
    SlotRestored {
        slot: Slot,
        bookings: Vec<Booking>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableSlot {
    #[serde(flatten)]
    pub slot: Slot,
    pub tutor_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TutorSlot {
    #[serde(flatten)]
    pub slot: Slot,
    /// Names of students with confirmed bookings, joined with ", ".
    pub student_names: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingDetail {
    #[serde(flatten)]
    pub booking: Booking,
    pub subject: String,
    pub description: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub tutor_name: Option<String>,
    pub tutor_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(capacity: u32, booked_count: u32, status: SlotStatus) -> Slot {
        Slot {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            subject: "Calculus".into(),
            description: String::new(),
            start_time: 10_000,
            end_time: 20_000,
            capacity,
            booked_count,
            status,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_containment_overlaps() {
        let outer = Span::new(0, 1000);
        let inner = Span::new(400, 500);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert_eq!(inner.duration_ms(), 100);
    }

    #[test]
    fn bookable_requires_future_start_and_free_seat() {
        let s = slot(2, 1, SlotStatus::Available);
        assert!(s.is_bookable(9_999));
        assert!(!s.is_bookable(10_000)); // start must be strictly after now

        let full = slot(2, 2, SlotStatus::Booked);
        assert!(!full.is_bookable(0));

        let void = slot(2, 0, SlotStatus::Cancelled);
        assert!(!void.is_bookable(0));
    }

    #[test]
    fn derived_status_follows_count() {
        assert_eq!(slot(2, 1, SlotStatus::Available).derived_status(), SlotStatus::Available);
        assert_eq!(slot(2, 2, SlotStatus::Available).derived_status(), SlotStatus::Booked);
        assert_eq!(slot(2, 1, SlotStatus::Booked).derived_status(), SlotStatus::Available);
        assert_eq!(slot(2, 0, SlotStatus::Cancelled).derived_status(), SlotStatus::Cancelled);
    }

    #[test]
    fn slot_state_counts_only_confirmed() {
        let mut state = SlotState::new(slot(3, 0, SlotStatus::Available));
        let student = Ulid::new();
        state.bookings.push(Booking {
            id: Ulid::new(),
            slot_id: state.slot.id,
            student_id: student,
            status: BookingStatus::Cancelled,
            created_at: 1,
            cancelled_at: Some(2),
        });
        state.bookings.push(Booking {
            id: Ulid::new(),
            slot_id: state.slot.id,
            student_id: Ulid::new(),
            status: BookingStatus::Confirmed,
            created_at: 3,
            cancelled_at: None,
        });
        assert_eq!(state.confirmed_count(), 1);
        assert!(state.has_booking_for(student));
        assert_eq!(state.confirmed_students().count(), 1);
    }

    #[test]
    fn role_and_status_parse_case_insensitively() {
        assert_eq!(Role::parse("Tutor"), Some(Role::Tutor));
        assert_eq!(Role::parse("admin"), None);
        assert_eq!(SlotStatus::parse("CANCELLED"), Some(SlotStatus::Cancelled));
        assert_eq!(SlotStatus::parse("gone"), None);
    }

    #[test]
    fn json_uses_snake_case_states() {
        let s = slot(1, 0, SlotStatus::Available);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "available");
        let view = TutorSlot {
            slot: s,
            student_names: Some("Ada, Grace".into()),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["student_names"], "Ada, Grace");
        assert_eq!(json["subject"], "Calculus");
    }

    #[test]
    fn empty_patch_detected() {
        assert!(SlotPatch::default().is_empty());
        let patch = SlotPatch {
            capacity: Some(3),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotCreated {
            slot: slot(1, 0, SlotStatus::Available),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
