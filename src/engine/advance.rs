use chrono::NaiveDate;

use crate::lifecycle;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::BOOKING_TRANSITIONS_TOTAL;

use super::{Engine, EngineError, SharedCarState};

/// Which bookings an `advance` call looks at.
#[derive(Debug, Clone, Copy)]
pub enum AdvanceScope<'a> {
    Car(CarId),
    Cars(&'a [CarId]),
    Owner(OwnerId),
    Renter(RenterId),
    All,
}

fn due(cs: &CarState, renter: Option<RenterId>, today: NaiveDate) -> Vec<(BookingId, BookingStatus)> {
    cs.bookings
        .iter()
        .filter(|b| renter.is_none_or(|r| b.renter_id == r))
        .filter_map(|b| lifecycle::due_transition(b, today).map(|next| (b.id, next)))
        .collect()
}

impl Engine {
    fn scope_cars(&self, scope: AdvanceScope<'_>) -> (Vec<SharedCarState>, Option<RenterId>) {
        match scope {
            AdvanceScope::Car(id) => (self.cars_in(&[id]), None),
            AdvanceScope::Cars(ids) => (self.cars_in(ids), None),
            AdvanceScope::Owner(owner) => {
                let ids = self
                    .index
                    .owner_cars
                    .get(&owner)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                (self.cars_in(&ids), None)
            }
            AdvanceScope::Renter(renter) => {
                let ids: Vec<CarId> = self
                    .index
                    .renter_cars
                    .get(&renter)
                    .map(|e| e.value().iter().copied().collect())
                    .unwrap_or_default();
                (self.cars_in(&ids), Some(renter))
            }
            AdvanceScope::All => (self.all_cars(), None),
        }
    }

    /// Apply the calendar-driven transitions due on `today` within `scope`.
    ///
    /// Each step is re-derived under the car's write lock, so concurrent or repeated
    /// calls converge on the same state. Returns the number of bookings moved.
    pub async fn advance(
        &self,
        scope: AdvanceScope<'_>,
        today: NaiveDate,
    ) -> Result<usize, EngineError> {
        let (cars, renter) = self.scope_cars(scope);
        let now = self.now();
        let mut moved = 0;
        for cs in cars {
            if due(&*cs.read().await, renter, today).is_empty() {
                continue;
            }
            let mut guard = cs.write().await;
            for (id, next) in due(&guard, renter, today) {
                let Some(current) = guard.booking(id).cloned() else {
                    continue;
                };
                let mut updated = current.clone();
                updated.status = next;
                updated.updated_at = now;
                let payment = if next == BookingStatus::Completed {
                    guard
                        .payments
                        .get(&id)
                        .filter(|p| {
                            matches!(
                                p.status,
                                PaymentRecordStatus::Pending | PaymentRecordStatus::Failed
                            )
                        })
                        .cloned()
                        .map(|mut p| {
                            p.status = PaymentRecordStatus::Completed;
                            p
                        })
                } else {
                    None
                };
                let event = Event::BookingUpdated {
                    booking: updated.clone(),
                    payment,
                    consumed_hold: None,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                moved += 1;

                metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
                tracing::debug!(
                    booking_id = %id,
                    car_id = %updated.car_id,
                    from = %current.status,
                    to = %next,
                    "booking advanced"
                );
                if next == BookingStatus::Completed {
                    self.notify.send(Notice::completed(&updated));
                }
            }
        }
        Ok(moved)
    }
}
