mod advance;
mod error;
mod holds;
mod inventory;
mod ledger;
mod queries;

pub use advance::AdvanceScope;
pub use error::EngineError;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::calendar::DateRange;
use crate::clock::Clock;
use crate::limits::MAX_RENTAL_DAYS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCarState = Arc<RwLock<CarState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then commits
/// the whole batch with one fsync before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        // Non-append commands observe everything queued before them.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Secondary indexes ────────────────────────────────────

#[derive(Default)]
pub(super) struct Index {
    /// Hold or booking id → car id.
    pub(super) entity_to_car: DashMap<Ulid, CarId>,
    /// Cars on which each renter has at least one booking.
    pub(super) renter_cars: DashMap<RenterId, HashSet<CarId>>,
    pub(super) owner_cars: DashMap<OwnerId, Vec<CarId>>,
}

/// Apply an event to a car (no locking, the caller holds the lock).
fn apply_to_car(cs: &mut CarState, event: &Event, index: &Index) {
    match event {
        Event::CarUpdated {
            daily_rate, listed, ..
        } => {
            cs.daily_rate = *daily_rate;
            cs.listed = *listed;
        }
        Event::HoldPlaced { hold } => {
            index.entity_to_car.insert(hold.id, cs.id);
            cs.insert_hold(hold.clone());
        }
        Event::HoldReleased { id, reason, .. } => match (cs.remove_hold(*id), reason) {
            // The id stays resolvable so a late confirm sees `HoldExpired`.
            (Some(hold), ReleaseReason::Expired) => {
                for dropped in cs.remember_lapsed(hold) {
                    index.entity_to_car.remove(&dropped);
                }
            }
            _ => {
                index.entity_to_car.remove(id);
            }
        },
        Event::BookingCreated {
            booking,
            payment,
            consumed_hold,
        }
        | Event::BookingUpdated {
            booking,
            payment,
            consumed_hold,
        } => {
            match cs.booking_mut(booking.id) {
                Some(existing) if existing.range == booking.range => *existing = booking.clone(),
                Some(_) => {
                    cs.remove_booking(booking.id);
                    cs.insert_booking(booking.clone());
                }
                None => cs.insert_booking(booking.clone()),
            }
            if let Some(payment) = payment {
                cs.payments.insert(booking.id, payment.clone());
            }
            if let Some(hold_id) = consumed_hold {
                cs.remove_hold(*hold_id);
                index.entity_to_car.remove(hold_id);
            }
            index.entity_to_car.insert(booking.id, cs.id);
            index
                .renter_cars
                .entry(booking.renter_id)
                .or_default()
                .insert(cs.id);
        }
        Event::BookingDeleted { id, .. } => {
            index.entity_to_car.remove(id);
            let Some(removed) = cs.remove_booking(*id) else {
                return;
            };
            if cs.bookings.iter().any(|b| b.renter_id == removed.renter_id) {
                return;
            }
            if let Some(mut cars) = index.renter_cars.get_mut(&removed.renter_id) {
                cars.remove(&cs.id);
            }
            index
                .renter_cars
                .remove_if(&removed.renter_id, |_, cars| cars.is_empty());
        }
        // Registration is handled at the map level.
        Event::CarRegistered { .. } => {}
    }
}

/// In-memory reservation state for every car, backed by the WAL.
///
/// Each car sits behind its own `RwLock`; every state change for a car runs
/// under that car's write lock, so check-and-write is atomic per car while
/// different cars proceed in parallel.
pub struct Engine {
    pub(super) cars: DashMap<CarId, SharedCarState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) index: Index,
    /// Serializes car registration with compaction snapshots.
    pub(super) registry: Mutex<()>,
}

impl Engine {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = Index::default();
        let mut cars: HashMap<CarId, CarState> = HashMap::new();
        for event in &events {
            match event {
                Event::CarRegistered {
                    id,
                    owner_id,
                    daily_rate,
                    listed,
                } => {
                    cars.insert(*id, CarState::new(*id, *owner_id, *daily_rate, *listed));
                    index.owner_cars.entry(*owner_id).or_default().push(*id);
                }
                other => match cars.get_mut(&other.car_id()) {
                    Some(cs) => apply_to_car(cs, other, &index),
                    None => tracing::warn!(car_id = %other.car_id(), "WAL event for unknown car"),
                },
            }
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            cars = cars.len(),
            "engine state restored"
        );

        let state = DashMap::with_capacity(cars.len());
        for (id, cs) in cars {
            state.insert(id, Arc::new(RwLock::new(cs)));
        }
        metrics::gauge!(crate::observability::CARS_REGISTERED).set(state.len() as f64);

        Ok(Self {
            cars: state,
            wal_tx,
            notify,
            clock,
            index,
            registry: Mutex::new(()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing changes in memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_car(cs, event, &self.index);
        Ok(())
    }

    pub(super) fn get_car(&self, id: &CarId) -> Result<SharedCarState, EngineError> {
        self.cars
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn car_for_entity(&self, entity_id: &Ulid) -> Option<CarId> {
        self.index.entity_to_car.get(entity_id).map(|e| *e.value())
    }

    /// Lookup entity → car, acquire the car's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CarState>, EngineError> {
        let car_id = self
            .car_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let cs = self.get_car(&car_id)?;
        Ok(cs.write_owned().await)
    }

    /// Snapshot of the car handles matching `ids`, skipping unknown ones.
    /// Never hold DashMap refs across an await.
    pub(super) fn cars_in(&self, ids: &[CarId]) -> Vec<SharedCarState> {
        ids.iter()
            .filter_map(|id| self.cars.get(id).map(|e| e.value().clone()))
            .collect()
    }

    pub(super) fn all_cars(&self) -> Vec<SharedCarState> {
        self.cars.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn car_ids(&self) -> Vec<CarId> {
        self.cars.iter().map(|e| *e.key()).collect()
    }
}

pub(super) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.start > range.end {
        return Err(EngineError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }
    if range.day_span() > MAX_RENTAL_DAYS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(())
}
