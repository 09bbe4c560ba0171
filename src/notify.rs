//! Post-commit notifications.
//!
//! Delivery is an external collaborator behind [`Notifier`]. The engine talks
//! to it only through [`Dispatcher`], which runs delivery on its own task:
//! a failed or slow notifier never changes the outcome of a booking.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{Ms, Slot, User};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

impl From<&User> for Contact {
    fn from(user: &User) -> Self {
        Self {
            name: user.name.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    pub slot_id: Ulid,
    pub subject: String,
    pub start_time: Ms,
    pub end_time: Ms,
}

impl SlotSummary {
    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time) / 60_000
    }
}

impl From<&Slot> for SlotSummary {
    fn from(slot: &Slot) -> Self {
        Self {
            slot_id: slot.id,
            subject: slot.subject.clone(),
            start_time: slot.start_time,
            end_time: slot.end_time,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery to {to} failed: {reason}")]
    Delivery { to: String, reason: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(
        &self,
        student: &Contact,
        tutor: &Contact,
        slot: &SlotSummary,
    ) -> Result<(), NotifyError>;

    async fn booking_cancelled(
        &self,
        recipient: &Contact,
        slot: &SlotSummary,
        tutor_side: bool,
    ) -> Result<(), NotifyError>;
}

// ── Message composition ──────────────────────────────────────────

/// A rendered notification, ready for whatever transport the collaborator uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: String,
    pub subject: String,
    pub body: String,
}

fn when(ms: Ms, offset: FixedOffset) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// The pair of confirmation messages: student first, then tutor.
pub fn compose_confirmation(
    student: &Contact,
    tutor: &Contact,
    slot: &SlotSummary,
    offset: FixedOffset,
) -> [Message; 2] {
    let subject = "Booking Confirmation - PeerLink".to_string();
    let at = when(slot.start_time, offset);
    [
        Message {
            to: student.email.clone(),
            subject: subject.clone(),
            body: format!(
                "Booking confirmed!\nSubject: {}\nDate & Time: {at}\nDuration: {} minutes\nTutor: {}",
                slot.subject,
                slot.duration_minutes(),
                tutor.name
            ),
        },
        Message {
            to: tutor.email.clone(),
            subject,
            body: format!(
                "New booking!\nSubject: {}\nDate & Time: {at}\nStudent: {}",
                slot.subject, student.name
            ),
        },
    ]
}

pub fn compose_cancellation(
    recipient: &Contact,
    slot: &SlotSummary,
    tutor_side: bool,
    offset: FixedOffset,
) -> Message {
    let lead = if tutor_side {
        "A booking on your session has been cancelled"
    } else {
        "Your session has been cancelled"
    };
    Message {
        to: recipient.email.clone(),
        subject: "Session Cancelled - PeerLink".into(),
        body: format!(
            "{lead}:\nSubject: {}\nDate & Time: {}",
            slot.subject,
            when(slot.start_time, offset)
        ),
    }
}

// ── Notifiers ────────────────────────────────────────────────────

/// Writes every message to the log. The default when no transport is wired.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    offset: FixedOffset,
}

impl LogNotifier {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(utc())
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn booking_confirmed(
        &self,
        student: &Contact,
        tutor: &Contact,
        slot: &SlotSummary,
    ) -> Result<(), NotifyError> {
        for msg in compose_confirmation(student, tutor, slot, self.offset) {
            info!(to = %msg.to, subject = %msg.subject, "notification");
        }
        Ok(())
    }

    async fn booking_cancelled(
        &self,
        recipient: &Contact,
        slot: &SlotSummary,
        tutor_side: bool,
    ) -> Result<(), NotifyError> {
        let msg = compose_cancellation(recipient, slot, tutor_side, self.offset);
        info!(to = %msg.to, subject = %msg.subject, "notification");
        Ok(())
    }
}

/// Fans rendered messages out to in-process subscribers (e.g. a mail relay task).
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Message>,
    offset: FixedOffset,
}

impl BroadcastNotifier {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            offset,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    /// No-op if nobody is listening.
    fn publish(&self, msg: Message) {
        let _ = self.sender.send(msg);
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn booking_confirmed(
        &self,
        student: &Contact,
        tutor: &Contact,
        slot: &SlotSummary,
    ) -> Result<(), NotifyError> {
        for msg in compose_confirmation(student, tutor, slot, self.offset) {
            self.publish(msg);
        }
        Ok(())
    }

    async fn booking_cancelled(
        &self,
        recipient: &Contact,
        slot: &SlotSummary,
        tutor_side: bool,
    ) -> Result<(), NotifyError> {
        self.publish(compose_cancellation(recipient, slot, tutor_side, self.offset));
        Ok(())
    }
}

pub(crate) fn utc() -> FixedOffset {
    chrono::Utc.fix()
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Fire-and-forget front for a [`Notifier`]. Must be called after commit.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn booking_confirmed(&self, student: Option<Contact>, tutor: Option<Contact>, slot: SlotSummary) {
        let (Some(student), Some(tutor)) = (student, tutor) else {
            debug!(slot = %slot.slot_id, "confirmation skipped: contact unknown");
            return;
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.booking_confirmed(&student, &tutor, &slot).await {
                warn!(slot = %slot.slot_id, "booking confirmation not delivered: {e}");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => "confirmed")
                    .increment(1);
            }
        });
    }

    /// Notifies each known party; the tutor gets the tutor-side framing.
    pub fn booking_cancelled(&self, student: Option<Contact>, tutor: Option<Contact>, slot: SlotSummary) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let parties = [(student, false), (tutor, true)];
            for (contact, tutor_side) in parties {
                let Some(contact) = contact else { continue };
                if let Err(e) = notifier.booking_cancelled(&contact, &slot, tutor_side).await {
                    warn!(slot = %slot.slot_id, "cancellation notice not delivered: {e}");
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => "cancelled")
                        .increment(1);
                }
            }
        });
    }
}
