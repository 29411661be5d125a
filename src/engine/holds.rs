use chrono::{DateTime, TimeDelta, Utc};
use ulid::Ulid;

use crate::calendar::DateRange;
use crate::limits::{MAX_HOLDS_PER_CAR, MAX_HOLD_TTL_MINUTES};
use crate::model::*;
use crate::observability::{HOLDS_PLACED_TOTAL, HOLDS_RELEASED_TOTAL};

use super::{validate_range, Engine, EngineError};

impl Engine {
    /// Remove expired holds from one car. Caller holds the write lock.
    pub(super) async fn purge_expired_locked(
        &self,
        cs: &mut CarState,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let expired = cs.expired_holds(now);
        for id in &expired {
            let event = Event::HoldReleased {
                id: *id,
                car_id: cs.id,
                reason: ReleaseReason::Expired,
            };
            self.persist_and_apply(cs, &event).await?;
        }
        if !expired.is_empty() {
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Expired.as_str())
                .increment(expired.len() as u64);
            tracing::debug!(car_id = %cs.id, count = expired.len(), "purged expired holds");
        }
        Ok(expired.len())
    }

    /// Purge one car only when it actually carries expired holds, so readers
    /// don't take the write lock on the common path.
    pub(super) async fn purge_car_if_needed(
        &self,
        car_id: &CarId,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let cs = self.get_car(car_id)?;
        let any_expired = cs.read().await.holds.iter().any(|h| h.is_expired(now));
        if !any_expired {
            return Ok(0);
        }
        let mut guard = cs.write().await;
        self.purge_expired_locked(&mut guard, now).await
    }

    /// Remove every expired hold on every car.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut total = 0;
        for car_id in self.car_ids() {
            total += self.purge_car_if_needed(&car_id, now).await?;
        }
        Ok(total)
    }

    /// Whether a live hold by someone other than `exclude_renter` overlaps `range`.
    pub async fn has_hold_conflict(
        &self,
        car_id: CarId,
        range: DateRange,
        exclude_renter: Option<RenterId>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .hold_conflict(car_id, range, exclude_renter)
            .await?
            .is_some())
    }

    pub(super) async fn hold_conflict(
        &self,
        car_id: CarId,
        range: DateRange,
        exclude_renter: Option<RenterId>,
    ) -> Result<Option<HoldId>, EngineError> {
        let now = self.now();
        self.purge_car_if_needed(&car_id, now).await?;
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        Ok(guard.hold_conflict(&range, exclude_renter, now))
    }

    /// Place a hold for `renter_id`, replacing any hold the renter already has on this car.
    ///
    /// Does not check availability: callers consult the inventory first.
    pub async fn create_hold(
        &self,
        renter_id: RenterId,
        car_id: CarId,
        range: DateRange,
        ttl: TimeDelta,
    ) -> Result<Hold, EngineError> {
        validate_range(&range)?;
        if ttl <= TimeDelta::zero() || ttl > TimeDelta::minutes(MAX_HOLD_TTL_MINUTES) {
            return Err(EngineError::LimitExceeded("hold ttl out of range"));
        }
        let now = self.now();
        let cs = self.get_car(&car_id)?;
        let mut guard = cs.write().await;
        if !guard.listed {
            return Err(EngineError::CarUnlisted(car_id));
        }
        self.purge_expired_locked(&mut guard, now).await?;

        let previous = guard.hold_for(renter_id).map(|h| h.id);
        if guard.holds.len() - usize::from(previous.is_some()) >= MAX_HOLDS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many holds on car"));
        }
        if let Some(previous) = previous {
            let event = Event::HoldReleased {
                id: previous,
                car_id,
                reason: ReleaseReason::Superseded,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Superseded.as_str())
                .increment(1);
        }

        let hold = Hold {
            id: Ulid::new(),
            renter_id,
            car_id,
            range,
            expires_at: now + ttl,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &Event::HoldPlaced { hold: hold.clone() })
            .await?;
        metrics::counter!(HOLDS_PLACED_TOTAL).increment(1);
        tracing::debug!(hold_id = %hold.id, %car_id, %renter_id, "hold placed");
        Ok(hold)
    }

    /// Drop a hold the renter walked away from.
    pub async fn release_hold(&self, hold_id: HoldId) -> Result<Hold, EngineError> {
        self.release_hold_with(hold_id, ReleaseReason::Abandoned).await
    }

    pub async fn release_hold_with(
        &self,
        hold_id: HoldId,
        reason: ReleaseReason,
    ) -> Result<Hold, EngineError> {
        let mut guard = self.resolve_entity_write(&hold_id).await?;
        let hold = guard
            .hold(hold_id)
            .cloned()
            .ok_or(EngineError::NotFound(hold_id))?;
        let event = Event::HoldReleased {
            id: hold_id,
            car_id: hold.car_id,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => reason.as_str()).increment(1);
        Ok(hold)
    }

    /// Release whatever hold `renter_id` has on `car_id`. `None` if there was none.
    pub async fn release_hold_for(
        &self,
        renter_id: RenterId,
        car_id: CarId,
    ) -> Result<Option<Hold>, EngineError> {
        let cs = self.get_car(&car_id)?;
        let mut guard = cs.write().await;
        let Some(hold) = guard.hold_for(renter_id).cloned() else {
            return Ok(None);
        };
        let event = Event::HoldReleased {
            id: hold.id,
            car_id,
            reason: ReleaseReason::Abandoned,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Abandoned.as_str())
            .increment(1);
        Ok(Some(hold))
    }

    /// Look up a hold. Expired holds that haven't been purged yet are still returned;
    /// check `Hold::is_expired` before trusting one. Purged ones are `HoldExpired`.
    pub async fn get_hold(&self, hold_id: HoldId) -> Result<Hold, EngineError> {
        let car_id = self
            .car_for_entity(&hold_id)
            .ok_or(EngineError::NotFound(hold_id))?;
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        match guard.hold(hold_id) {
            Some(hold) => Ok(hold.clone()),
            None if guard.lapsed_hold(hold_id).is_some() => Err(EngineError::HoldExpired(hold_id)),
            None => Err(EngineError::NotFound(hold_id)),
        }
    }

    /// Live holds on a car.
    pub async fn holds_for(&self, car_id: CarId) -> Result<Vec<Hold>, EngineError> {
        let now = self.now();
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        Ok(guard
            .holds
            .iter()
            .filter(|h| !h.is_expired(now))
            .cloned()
            .collect())
    }
}
