use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};

use crate::limits::MAX_CARS;
use crate::model::*;

use super::{AdvanceScope, Engine, EngineError, WalCommand};

fn by_newest(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

impl Engine {
    // ── Cars ─────────────────────────────────────────────────

    pub async fn register_car(
        &self,
        id: CarId,
        owner_id: OwnerId,
        daily_rate: Decimal,
    ) -> Result<CarInfo, EngineError> {
        let _registry = self.registry.lock().await;
        if self.cars.len() >= MAX_CARS {
            return Err(EngineError::LimitExceeded("too many cars"));
        }
        if self.cars.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CarRegistered {
            id,
            owner_id,
            daily_rate,
            listed: true,
        };
        self.wal_append(&event).await?;
        let cs = CarState::new(id, owner_id, daily_rate, true);
        let info = cs.info();
        self.cars.insert(id, Arc::new(RwLock::new(cs)));
        self.index.owner_cars.entry(owner_id).or_default().push(id);
        metrics::gauge!(crate::observability::CARS_REGISTERED).set(self.cars.len() as f64);
        tracing::info!(car_id = %id, %owner_id, "car registered");
        Ok(info)
    }

    /// Change the rate or take the car on/off the market. Existing bookings keep
    /// the price they were created with.
    pub async fn update_car(
        &self,
        id: CarId,
        daily_rate: Decimal,
        listed: bool,
    ) -> Result<CarInfo, EngineError> {
        let cs = self.get_car(&id)?;
        let mut guard = cs.write().await;
        let event = Event::CarUpdated {
            id,
            daily_rate,
            listed,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn car_info(&self, id: CarId) -> Result<CarInfo, EngineError> {
        let cs = self.get_car(&id)?;
        let guard = cs.read().await;
        Ok(guard.info())
    }

    pub async fn list_cars(&self) -> Vec<CarInfo> {
        let mut out = Vec::with_capacity(self.cars.len());
        for cs in self.all_cars() {
            out.push(cs.read().await.info());
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn cars_of_owner(&self, owner_id: OwnerId) -> Vec<CarInfo> {
        let ids = self
            .index
            .owner_cars
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for cs in self.cars_in(&ids) {
            out.push(cs.read().await.info());
        }
        out
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let car_id = self.car_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        self.advance(AdvanceScope::Car(car_id), self.today()).await?;
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn payment_for(&self, booking_id: BookingId) -> Result<Option<Payment>, EngineError> {
        let car_id = self
            .car_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard.payments.get(&booking_id).cloned())
    }

    /// Every booking a renter ever made, newest first.
    pub async fn bookings_for_renter(
        &self,
        renter_id: RenterId,
    ) -> Result<Vec<Booking>, EngineError> {
        self.advance(AdvanceScope::Renter(renter_id), self.today())
            .await?;
        let car_ids: Vec<CarId> = self
            .index
            .renter_cars
            .get(&renter_id)
            .map(|e| e.value().iter().copied().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for cs in self.cars_in(&car_ids) {
            let guard = cs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.renter_id == renter_id)
                    .cloned(),
            );
        }
        by_newest(&mut out);
        Ok(out)
    }

    /// Pending, confirmed, or ongoing bookings of a renter.
    pub async fn active_bookings_for_renter(
        &self,
        renter_id: RenterId,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut out = self.bookings_for_renter(renter_id).await?;
        out.retain(|b| !b.status.is_terminal());
        Ok(out)
    }

    /// Bookings on every car of `owner_id`, optionally narrowed to one status, newest first.
    pub async fn bookings_for_owner(
        &self,
        owner_id: OwnerId,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError> {
        self.advance(AdvanceScope::Owner(owner_id), self.today())
            .await?;
        let car_ids = self
            .index
            .owner_cars
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for cs in self.cars_in(&car_ids) {
            let guard = cs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        by_newest(&mut out);
        Ok(out)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the records needed to rebuild the current state.
    ///
    /// Every car's read lock is held until the writer has swapped the file, so no
    /// append can land between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guards = Vec::with_capacity(self.cars.len());
        for cs in self.all_cars() {
            guards.push(cs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::CarRegistered {
                id: guard.id,
                owner_id: guard.owner_id,
                daily_rate: guard.daily_rate,
                listed: guard.listed,
            });
            for hold in &guard.holds {
                events.push(Event::HoldPlaced { hold: hold.clone() });
            }
            let mut lapsed: Vec<&Hold> = guard.lapsed_holds.values().collect();
            lapsed.sort_by_key(|h| h.expires_at);
            for hold in lapsed {
                events.push(Event::HoldPlaced { hold: hold.clone() });
                events.push(Event::HoldReleased {
                    id: hold.id,
                    car_id: guard.id,
                    reason: ReleaseReason::Expired,
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    payment: guard.payments.get(&booking.id).cloned(),
                    consumed_hold: None,
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        metrics::counter!(
            crate::observability::WAL_COMPACTIONS_TOTAL,
            "status" => crate::observability::status_label(&result)
        )
        .increment(1);
        if result.is_ok() {
            tracing::info!(records = count, "WAL compacted");
        }
        drop(guards);
        result
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
