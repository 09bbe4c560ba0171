use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_SLOTS;
use crate::model::*;

use super::{policy, Engine, EngineError, SharedSlotState};

impl Engine {
    /// Open a new slot for `tutor_id`. Rejects any overlap with the tutor's
    /// other non-cancelled slots.
    pub async fn create_slot(&self, tutor_id: Ulid, new: NewSlot) -> Result<Slot, EngineError> {
        policy::validate_new_slot(&new)?;
        let _gate = self.begin().await;
        let _tutor = self.lock_principal(tutor_id).await;
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let span = Span::new(new.start_time, new.end_time);
        for id in self.index.slots_of(&tutor_id) {
            let Some(shared) = self.get_slot_state(&id) else { continue };
            let guard = shared.read().await;
            if guard.slot.status != SlotStatus::Cancelled && guard.slot.span().overlaps(&span) {
                return Err(EngineError::Overlap { existing: id });
            }
        }

        let slot = Slot {
            id: Ulid::new(),
            tutor_id,
            subject: new.subject,
            description: new.description.unwrap_or_default(),
            start_time: new.start_time,
            end_time: new.end_time,
            capacity: new.capacity.unwrap_or(1),
            booked_count: 0,
            status: SlotStatus::Available,
        };
        self.wal_append(&Event::SlotCreated { slot: slot.clone() })
            .await?;
        self.insert_slot(slot.clone(), Vec::new());
        info!(slot = %slot.id, tutor = %tutor_id, "slot created");
        Ok(slot)
    }

    /// Open slots starting after now, ascending by start time.
    pub async fn list_available(&self, filter: &SlotFilter) -> Vec<AvailableSlot> {
        let now = self.now();
        let needle = filter.subject.as_ref().map(|s| s.to_lowercase());
        let candidates: Vec<SharedSlotState> = match filter.tutor_id {
            Some(tutor) => self
                .index
                .slots_of(&tutor)
                .iter()
                .filter_map(|id| self.get_slot_state(id))
                .collect(),
            None => self.slots.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for shared in candidates {
            let slot = shared.read().await.slot.clone();
            if !slot.is_bookable(now) {
                continue;
            }
            if let Some(date) = filter.date
                && self.local_date(slot.start_time) != Some(date)
            {
                continue;
            }
            if let Some(needle) = &needle
                && !slot.subject.to_lowercase().contains(needle.as_str())
            {
                continue;
            }
            let tutor_name = self.users.get(&slot.tutor_id).map(|u| u.name.clone());
            out.push(AvailableSlot { slot, tutor_name });
        }
        out.sort_by_key(|s| (s.slot.start_time, s.slot.id));
        out
    }

    /// Every slot the tutor owns, ascending by start time, with the names of
    /// students holding confirmed bookings.
    pub async fn list_by_tutor(&self, tutor_id: Ulid) -> Vec<TutorSlot> {
        let mut out = Vec::new();
        for id in self.index.slots_of(&tutor_id) {
            let Some(shared) = self.get_slot_state(&id) else { continue };
            let (slot, students) = {
                let guard = shared.read().await;
                let students: Vec<Ulid> = guard.confirmed_students().collect();
                (guard.slot.clone(), students)
            };
            let names: Vec<String> = students
                .iter()
                .filter_map(|s| self.users.get(s).map(|u| u.name.clone()))
                .collect();
            let student_names = (!names.is_empty()).then(|| names.join(", "));
            out.push(TutorSlot { slot, student_names });
        }
        out.sort_by_key(|s| (s.slot.start_time, s.slot.id));
        out
    }

    /// Apply a partial edit to a slot the tutor owns. Times are not checked
    /// against the tutor's other slots.
    pub async fn update_slot(
        &self,
        slot_id: Ulid,
        tutor_id: Ulid,
        patch: SlotPatch,
    ) -> Result<Slot, EngineError> {
        let _gate = self.begin().await;
        let mut guard = self
            .write_slot(&slot_id)
            .await
            .ok_or(EngineError::NotFoundOrUnauthorized(slot_id))?;
        if guard.slot.tutor_id != tutor_id {
            return Err(EngineError::NotFoundOrUnauthorized(slot_id));
        }
        if patch.is_empty() {
            return Ok(guard.slot.clone());
        }

        let next = policy::patched_slot(&guard.slot, &patch)?;
        let event = Event::SlotUpdated { slot: next };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(slot = %slot_id, status = guard.slot.status.as_str(), "slot updated");
        Ok(guard.slot.clone())
    }

    /// Remove a slot the tutor owns, together with all of its bookings.
    pub async fn delete_slot(&self, slot_id: Ulid, tutor_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.begin().await;
        let mut guard = self
            .write_slot(&slot_id)
            .await
            .ok_or(EngineError::NotFoundOrUnauthorized(slot_id))?;
        if guard.slot.tutor_id != tutor_id {
            return Err(EngineError::NotFoundOrUnauthorized(slot_id));
        }

        let event = Event::SlotDeleted { id: slot_id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.drop_slot(&slot_id, &tutor_id);
        info!(slot = %slot_id, bookings = guard.bookings.len(), "slot deleted");
        Ok(())
    }

    fn local_date(&self, ms: Ms) -> Option<chrono::NaiveDate> {
        chrono::DateTime::from_timestamp_millis(ms)
            .map(|t| t.with_timezone(&self.local_offset).date_naive())
    }
}
