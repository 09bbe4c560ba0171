mod bookings;
mod error;
mod index;
mod policy;
mod slots;

pub use error::{Category, EngineError};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::FixedOffset;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::MAX_USERS;
use crate::model::*;
use crate::notify::{Contact, Dispatcher, LogNotifier, Notifier};
use crate::wal::Wal;

use index::Index;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and made durable with a single fsync; each caller is
/// answered only after that fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("wal writer stopped");
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so the rejected bytes do not
    // ride along with the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let reply = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// Collaborators injected into the engine.
pub struct EngineEnv {
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    /// Offset used to resolve a calendar date filter.
    pub local_offset: FixedOffset,
}

impl Default for EngineEnv {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier::default()),
            local_offset: crate::notify::utc(),
        }
    }
}

/// The slot store and booking engine.
///
/// Lock order, outermost first: `commit_gate` (read for mutations, write for
/// compaction), one principal lock, one slot lock. No code path holds two
/// slot locks at once.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) index: Index,
    /// Serializes the transactions of one tutor (create) or student (book).
    principal_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) dispatcher: Dispatcher,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) local_offset: FixedOffset,
}

/// Holds one principal's mutex. On drop, the map entry goes away once no
/// other task holds or waits on it.
pub(super) struct PrincipalGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    id: Ulid,
    locks: &'a DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Drop for PrincipalGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // `entry()` clones under the same shard lock, so a count of 1 means
        // the map holds the only reference.
        self.locks.remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Apply an event to one slot. The caller holds that slot's write lock.
/// Replay and the live path both go through here.
fn apply_to_slot(state: &mut SlotState, event: &Event, index: &Index) {
    match event {
        Event::SlotUpdated { slot } => state.slot = slot.clone(),
        Event::BookingConfirmed { booking } => {
            index.add_booking(booking.id, booking.slot_id, booking.student_id);
            state.bookings.push(booking.clone());
            policy::take_seat(&mut state.slot);
        }
        Event::BookingCancelled { id, cancelled_at, .. } => {
            if let Some(b) = state.bookings.iter_mut().find(|b| b.id == *id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*cancelled_at);
            }
            let remaining = state.confirmed_count();
            policy::release_seat(&mut state.slot, remaining);
        }
        Event::SlotDeleted { .. } => {
            for b in &state.bookings {
                index.remove_booking(&b.id, &b.student_id);
            }
        }
        // Map-level events, handled by the engine itself.
        Event::UserRegistered { .. } | Event::SlotCreated { .. } | Event::SlotRestored { .. } => {}
    }
}

/// Slot an event belongs to, for events applied under a slot lock.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotUpdated { slot } => Some(slot.id),
        Event::SlotDeleted { id, .. } => Some(*id),
        Event::BookingConfirmed { booking } => Some(booking.slot_id),
        Event::BookingCancelled { slot_id, .. } => Some(*slot_id),
        Event::UserRegistered { .. } | Event::SlotCreated { .. } | Event::SlotRestored { .. } => {
            None
        }
    }
}

impl Engine {
    /// Replay the log at `wal_path`, truncating any torn tail, then start
    /// the WAL writer. Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, env: EngineEnv) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            users: DashMap::new(),
            index: Index::new(),
            principal_locks: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            dispatcher: Dispatcher::new(env.notifier),
            clock: env.clock,
            local_offset: env.local_offset,
        };

        let replayed = events.len();
        for event in events {
            engine.replay_event(event);
        }
        info!(
            path = %wal_path.display(),
            events = replayed,
            slots = engine.slots.len(),
            users = engine.users.len(),
            "engine ready"
        );
        Ok(engine)
    }

    /// Nothing else holds the slot locks during replay, so `try_write`
    /// always succeeds.
    fn replay_event(&self, event: Event) {
        match event {
            Event::UserRegistered { user } => {
                self.users.insert(user.id, user);
            }
            Event::SlotCreated { slot } => self.insert_slot(slot, Vec::new()),
            Event::SlotRestored { slot, bookings } => self.insert_slot(slot, bookings),
            other => {
                let Some(slot_id) = event_slot_id(&other) else { return };
                let Some(shared) = self.get_slot_state(&slot_id) else { return };
                if let Ok(mut guard) = shared.try_write() {
                    apply_to_slot(&mut guard, &other, &self.index);
                }
                if let Event::SlotDeleted { id, tutor_id } = other {
                    self.drop_slot(&id, &tutor_id);
                }
            }
        }
    }

    pub(super) fn insert_slot(&self, slot: Slot, bookings: Vec<Booking>) {
        self.index.add_slot(slot.tutor_id, slot.id);
        for b in &bookings {
            self.index.add_booking(b.id, b.slot_id, b.student_id);
        }
        let id = slot.id;
        self.slots
            .insert(id, Arc::new(RwLock::new(SlotState { slot, bookings })));
    }

    pub(super) fn drop_slot(&self, id: &Ulid, tutor_id: &Ulid) {
        self.index.remove_slot(tutor_id, id);
        self.slots.remove(id);
    }

    /// Hand an event to the group-commit writer and wait for its fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durably log `event`, then apply it to the locked slot. Nothing changes
    /// in memory if the log write fails.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(state, event, &self.index);
        Ok(())
    }

    /// Admission to the commit path. Held for the whole transaction.
    pub(super) async fn begin(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    pub(super) async fn lock_principal(&self, id: Ulid) -> PrincipalGuard<'_> {
        let lock = self.principal_locks.entry(id).or_default().clone();
        PrincipalGuard {
            guard: Some(lock.lock_owned().await),
            id,
            locks: &self.principal_locks,
        }
    }

    pub(super) fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a live slot. A slot deleted while we waited reads as absent.
    pub(super) async fn write_slot(&self, id: &Ulid) -> Option<OwnedRwLockWriteGuard<SlotState>> {
        let shared = self.get_slot_state(id)?;
        let guard = shared.clone().write_owned().await;
        let live = self
            .slots
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
        live.then_some(guard)
    }

    pub(super) fn contact(&self, id: &Ulid) -> Option<Contact> {
        self.users.get(id).map(|u| Contact::from(u.value()))
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn local_offset(&self) -> FixedOffset {
        self.local_offset
    }

    pub async fn get_slot(&self, id: &Ulid) -> Option<Slot> {
        let shared = self.get_slot_state(id)?;
        let guard = shared.read().await;
        Some(guard.slot.clone())
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // ── Users ────────────────────────────────────────────

    pub async fn register_user(&self, user: User) -> Result<User, EngineError> {
        policy::validate_user(&user)?;
        let _gate = self.begin().await;
        let _principal = self.lock_principal(user.id).await;
        if self.users.contains_key(&user.id) {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let event = Event::UserRegistered { user: user.clone() };
        self.wal_append(&event).await?;
        self.users.insert(user.id, user.clone());
        info!(user = %user.id, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the log as one snapshot of the current state. Blocks new
    /// transactions for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserRegistered {
                user: u.value().clone(),
            })
            .collect();
        let shared: Vec<SharedSlotState> = self.slots.iter().map(|e| e.value().clone()).collect();
        for state in shared {
            let guard = state.read().await;
            events.push(Event::SlotRestored {
                slot: guard.slot.clone(),
                bookings: guard.bookings.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!(events = count, "wal compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
