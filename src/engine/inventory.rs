use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::DateRange;
use crate::limits::MAX_CANDIDATE_POOL;
use crate::model::*;

use super::{validate_range, AdvanceScope, Engine, EngineError};

impl Engine {
    /// First booking or foreign hold in the way of `range` on `car_id`, if any.
    pub async fn first_conflict(
        &self,
        car_id: CarId,
        range: DateRange,
        exclude_renter: Option<RenterId>,
    ) -> Result<Option<Ulid>, EngineError> {
        validate_range(&range)?;
        self.advance(AdvanceScope::Car(car_id), self.today()).await?;
        let now = self.now();
        self.purge_car_if_needed(&car_id, now).await?;

        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        Ok(guard
            .blocking_conflict(&range, None)
            .or_else(|| guard.hold_conflict(&range, exclude_renter, now)))
    }

    /// No blocking booking and no other renter's live hold overlaps `range`.
    pub async fn is_free(
        &self,
        car_id: CarId,
        range: DateRange,
        exclude_renter: Option<RenterId>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .first_conflict(car_id, range, exclude_renter)
            .await?
            .is_none())
    }

    /// Cars from `pool` that can be booked for `range`: listed, no blocking booking,
    /// and not held by anyone other than `exclude_renter`.
    pub async fn list_available(
        &self,
        range: DateRange,
        pool: &[CarId],
        exclude_renter: Option<RenterId>,
    ) -> Result<BTreeSet<CarId>, EngineError> {
        validate_range(&range)?;
        if pool.len() > MAX_CANDIDATE_POOL {
            return Err(EngineError::LimitExceeded("candidate pool too large"));
        }
        self.advance(AdvanceScope::Cars(pool), self.today()).await?;

        let mut free = self.available_cars(range, pool).await?;
        let now = self.now();
        let mut held = HashSet::new();
        for car_id in &free {
            self.purge_car_if_needed(car_id, now).await?;
            let cs = self.get_car(car_id)?;
            let guard = cs.read().await;
            if guard.hold_conflict(&range, exclude_renter, now).is_some() {
                held.insert(*car_id);
            }
        }
        free.retain(|id| !held.contains(id));
        Ok(free)
    }

    /// Days from today onward taken by blocking bookings or live holds. Feeds a
    /// renter-facing calendar, so past days are left out.
    pub async fn booked_dates(&self, car_id: CarId) -> Result<Vec<NaiveDate>, EngineError> {
        let today = self.today();
        self.advance(AdvanceScope::Car(car_id), today).await?;
        let now = self.now();
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;

        let booked = guard
            .bookings
            .iter()
            .filter(|b| b.is_blocking() && b.range.end >= today)
            .map(|b| b.range);
        let held = guard
            .holds
            .iter()
            .filter(|h| !h.is_expired(now) && h.range.end >= today)
            .map(|h| h.range);

        let days: BTreeSet<NaiveDate> = booked
            .chain(held)
            .flat_map(|r| r.days())
            .filter(|d| *d >= today)
            .collect();
        Ok(days.into_iter().collect())
    }
}
