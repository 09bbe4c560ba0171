use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::SlotSummary;

use super::{policy, Engine, EngineError};

impl Engine {
    /// Spans of the student's confirmed bookings on slots other than `except`.
    /// Each slot is read-locked on its own, before any write lock is taken.
    async fn confirmed_spans(&self, student_id: Ulid, except: Ulid) -> Vec<(Ulid, Span)> {
        let mut spans = Vec::new();
        for (booking_id, slot_id) in self.index.bookings_of(&student_id) {
            if slot_id == except {
                continue;
            }
            let Some(shared) = self.get_slot_state(&slot_id) else { continue };
            let guard = shared.read().await;
            if guard.booking(booking_id).is_some_and(Booking::is_confirmed) {
                spans.push((booking_id, guard.slot.span()));
            }
        }
        spans
    }

    /// Reserve a seat on `slot_id` for `student_id`.
    ///
    /// Checks run in a fixed order: the slot must be open, the student must
    /// be free for its interval, and the student must never have booked this
    /// slot before. The booking and the seat count change together.
    pub async fn book(&self, student_id: Ulid, slot_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.begin().await;
        let _student = self.lock_principal(student_id).await;
        let others = self.confirmed_spans(student_id, slot_id).await;

        let mut guard = self
            .write_slot(&slot_id)
            .await
            .ok_or(EngineError::SlotUnavailable(slot_id))?;
        let now = self.now();
        if !guard.slot.is_bookable(now) {
            return Err(EngineError::SlotUnavailable(slot_id));
        }
        let span = guard.slot.span();
        if let Some((existing, _)) = others.iter().find(|(_, s)| s.overlaps(&span)) {
            return Err(EngineError::OverlappingBooking {
                existing: *existing,
            });
        }
        if guard.has_booking_for(student_id) {
            return Err(EngineError::AlreadyBooked(slot_id));
        }

        let booking = Booking {
            id: Ulid::new(),
            slot_id,
            student_id,
            status: BookingStatus::Confirmed,
            created_at: now,
            cancelled_at: None,
        };
        let event = Event::BookingConfirmed {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let summary = SlotSummary::from(&guard.slot);
        let tutor_id = guard.slot.tutor_id;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        info!(booking = %booking.id, slot = %slot_id, student = %student_id, "booking confirmed");
        self.dispatcher
            .booking_confirmed(self.contact(&student_id), self.contact(&tutor_id), summary);
        Ok(booking)
    }

    /// Bookings of one student with slot and tutor details, latest session first.
    pub async fn list_my_bookings(&self, student_id: Ulid) -> Vec<BookingDetail> {
        let mut out = Vec::new();
        for (booking_id, slot_id) in self.index.bookings_of(&student_id) {
            let Some(shared) = self.get_slot_state(&slot_id) else { continue };
            let guard = shared.read().await;
            let Some(booking) = guard.booking(booking_id).cloned() else { continue };
            let slot = &guard.slot;
            let tutor = self.users.get(&slot.tutor_id);
            out.push(BookingDetail {
                booking,
                subject: slot.subject.clone(),
                description: slot.description.clone(),
                start_time: slot.start_time,
                end_time: slot.end_time,
                tutor_name: tutor.as_ref().map(|u| u.name.clone()),
                tutor_email: tutor.as_ref().map(|u| u.email.clone()),
            });
        }
        out.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| b.booking.id.cmp(&a.booking.id))
        });
        out
    }

    /// Cancel a booking on behalf of its student or the slot's tutor.
    /// The row is kept with status `cancelled`.
    pub async fn cancel(&self, actor_id: Ulid, booking_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.begin().await;
        let slot_id = self
            .index
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self
            .write_slot(&slot_id)
            .await
            .ok_or(EngineError::NotFound(booking_id))?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let tutor_id = guard.slot.tutor_id;
        if actor_id != booking.student_id && actor_id != tutor_id {
            return Err(EngineError::Unauthorized(booking_id));
        }
        if !booking.is_confirmed() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }
        let now = self.now();
        policy::check_cancellation_window(guard.slot.start_time, now)?;

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            cancelled_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let summary = SlotSummary::from(&guard.slot);
        let (booked, status) = (guard.slot.booked_count, guard.slot.status);
        drop(guard);

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        info!(
            booking = %booking_id,
            slot = %slot_id,
            actor = %actor_id,
            booked,
            status = status.as_str(),
            "booking cancelled"
        );
        if status == SlotStatus::Cancelled {
            debug!(slot = %slot_id, "last confirmed booking cancelled; slot void");
        }
        self.dispatcher.booking_cancelled(
            self.contact(&booking.student_id),
            self.contact(&tutor_id),
            summary,
        );
        Ok(())
    }
}
