use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::calendar::{price_for, DateRange};
use crate::lifecycle::{self, Trigger};
use crate::limits::{MAX_BOOKINGS_PER_CAR, MAX_CANDIDATE_POOL};
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{
    BOOKINGS_CREATED_TOTAL, BOOKING_CONFLICTS_TOTAL, BOOKING_TRANSITIONS_TOTAL,
    HOLDS_RELEASED_TOTAL, STALE_BOOKINGS_CLEARED_TOTAL,
};

use super::{validate_range, Engine, EngineError};

fn conflict(car_id: CarId, by: Ulid) -> EngineError {
    metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
    EngineError::Conflict { car_id, by }
}

fn record_transition(booking: &Booking, from: BookingStatus) {
    metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "to" => booking.status.as_str()).increment(1);
    tracing::info!(
        booking_id = %booking.id,
        car_id = %booking.car_id,
        %from,
        to = %booking.status,
        "booking transition"
    );
}

/// Refuse any other transition while a gateway refund for the booking is outstanding.
fn ensure_settled(cs: &CarState, booking: &Booking, action: &'static str) -> Result<(), EngineError> {
    if cs.refund_in_flight(booking.id) {
        return Err(EngineError::InvalidState {
            id: booking.id,
            status: booking.status,
            action,
        });
    }
    Ok(())
}

fn is_stale(b: &Booking, cutoff: DateTime<Utc>) -> bool {
    b.status == BookingStatus::Pending
        && b.payment_status != PaymentStatus::Paid
        && b.payment_status != PaymentStatus::Refunded
        && b.created_at < cutoff
}

impl Engine {
    /// Whether a blocking booking other than `exclude` overlaps `range`.
    pub async fn has_conflict(
        &self,
        car_id: CarId,
        range: DateRange,
        exclude: Option<BookingId>,
    ) -> Result<bool, EngineError> {
        let cs = self.get_car(&car_id)?;
        let guard = cs.read().await;
        Ok(guard.blocking_conflict(&range, exclude).is_some())
    }

    /// Listed cars from `pool` with no blocking booking in `range`. Unknown cars are skipped.
    pub async fn available_cars(
        &self,
        range: DateRange,
        pool: &[CarId],
    ) -> Result<BTreeSet<CarId>, EngineError> {
        validate_range(&range)?;
        if pool.len() > MAX_CANDIDATE_POOL {
            return Err(EngineError::LimitExceeded("candidate pool too large"));
        }
        let mut free = BTreeSet::new();
        for cs in self.cars_in(pool) {
            let guard = cs.read().await;
            if guard.listed && guard.blocking_conflict(&range, None).is_none() {
                free.insert(guard.id);
            }
        }
        Ok(free)
    }

    /// Turn a live hold into a pending booking, re-checking the calendar under the car lock.
    ///
    /// A paid booking blocks the car immediately and consumes the hold. An unpaid one
    /// (checkout opened, capture outstanding) keeps the hold until `capture_payment`.
    pub async fn create_from_hold(
        &self,
        hold_id: HoldId,
        renter_id: RenterId,
        paid: bool,
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_entity_write(&hold_id).await?;
        let Some(hold) = guard.hold(hold_id).cloned() else {
            return Err(match guard.lapsed_hold(hold_id) {
                Some(lapsed) if lapsed.renter_id != renter_id => EngineError::Forbidden {
                    actor: renter_id,
                    target: hold_id,
                },
                Some(_) => EngineError::HoldExpired(hold_id),
                None => EngineError::NotFound(hold_id),
            });
        };
        if hold.renter_id != renter_id {
            return Err(EngineError::Forbidden {
                actor: renter_id,
                target: hold_id,
            });
        }
        if hold.is_expired(now) {
            let event = Event::HoldReleased {
                id: hold_id,
                car_id: hold.car_id,
                reason: ReleaseReason::Expired,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Expired.as_str())
                .increment(1);
            return Err(EngineError::HoldExpired(hold_id));
        }
        if !guard.listed {
            return Err(EngineError::CarUnlisted(hold.car_id));
        }
        if let Some(by) = guard.blocking_conflict(&hold.range, None) {
            return Err(conflict(hold.car_id, by));
        }
        if !paid
            && let Some(open) = guard.bookings.iter().find(|b| {
                b.renter_id == renter_id
                    && b.range == hold.range
                    && b.status == BookingStatus::Pending
                    && b.payment_status == PaymentStatus::Pending
            })
        {
            return Ok(open.clone());
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many bookings on car"));
        }

        let total_price = price_for(&hold.range, guard.daily_rate);
        let booking = Booking {
            id: Ulid::new(),
            renter_id,
            car_id: hold.car_id,
            range: hold.range,
            status: BookingStatus::Pending,
            payment_status: if paid {
                PaymentStatus::Paid
            } else {
                PaymentStatus::Pending
            },
            total_price,
            created_at: now,
            updated_at: now,
        };
        let payment = Payment {
            id: Ulid::new(),
            booking_id: booking.id,
            amount: total_price,
            status: if paid {
                PaymentRecordStatus::Completed
            } else {
                PaymentRecordStatus::Pending
            },
            refund_id: None,
            created_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            payment: Some(payment),
            consumed_hold: paid.then_some(hold_id),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(BOOKINGS_CREATED_TOTAL, "payment" => if paid { "paid" } else { "pending" })
            .increment(1);
        tracing::info!(
            booking_id = %booking.id,
            car_id = %booking.car_id,
            %renter_id,
            paid,
            "booking created"
        );
        if paid {
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Converted.as_str())
                .increment(1);
            self.notify.send(Notice::payment_received(&booking));
        }
        Ok(booking)
    }

    /// Owner accepts a pending booking.
    pub async fn accept(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_settled(&guard, &current, "accept")?;
        let next = lifecycle::transition(&current, Trigger::Accept)?;
        // An unpaid booking starts blocking here, so the calendar must still be clear.
        if !current.is_blocking()
            && let Some(by) = guard.blocking_conflict(&current.range, Some(booking_id))
        {
            return Err(conflict(current.car_id, by));
        }

        let mut updated = current.clone();
        updated.status = next;
        updated.updated_at = now;
        let event = Event::BookingUpdated {
            booking: updated.clone(),
            payment: None,
            consumed_hold: None,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_transition(&updated, current.status);
        self.notify.send(Notice::confirmed(&updated));
        Ok(updated)
    }

    /// Owner rejects a pending booking. A paid booking goes straight to refunded;
    /// the caller is responsible for having moved the money.
    pub async fn reject(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        self.reject_with(booking_id, None).await
    }

    pub async fn reject_with(
        &self,
        booking_id: BookingId,
        refund_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_settled(&guard, &current, "reject")?;
        self.settle_rejection(&mut guard, current, refund_id).await
    }

    /// Reject a booking that holds no money. Refused once the booking is paid.
    pub async fn reject_unpaid(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if current.payment_status == PaymentStatus::Paid {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: current.status,
                action: "reject without refund",
            });
        }
        self.settle_rejection(&mut guard, current, None).await
    }

    /// Record a completed gateway refund. Valid for any paid booking not already refunded.
    pub async fn mark_refunded(
        &self,
        booking_id: BookingId,
        refund_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_settled(&guard, &current, "refund")?;
        self.settle_refund(&mut guard, current, refund_id).await
    }

    /// Claim the refund of a paid booking before the gateway is called. `trigger` is
    /// the transition that will settle it (`Reject` or `Refund`); the claim fails if
    /// that transition would not end in a refund or another refund is outstanding.
    pub async fn begin_refund(
        &self,
        booking_id: BookingId,
        trigger: Trigger,
    ) -> Result<Payment, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_settled(&guard, &current, trigger.action())?;
        let next = lifecycle::transition(&current, trigger)?;
        if next != BookingStatus::Refunded {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: current.status,
                action: "refund",
            });
        }
        let mut payment = guard
            .payments
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        payment.status = PaymentRecordStatus::RefundPending;
        let event = Event::BookingUpdated {
            booking: current,
            payment: Some(payment.clone()),
            consumed_hold: None,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(%booking_id, "refund claimed");
        Ok(payment)
    }

    /// Settle a refund claimed by `begin_refund` with the same `trigger`.
    pub async fn complete_refund(
        &self,
        booking_id: BookingId,
        trigger: Trigger,
        refund_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !guard.refund_in_flight(booking_id) {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: current.status,
                action: "complete refund for",
            });
        }
        match trigger {
            Trigger::Reject => self.settle_rejection(&mut guard, current, refund_id).await,
            _ => self.settle_refund(&mut guard, current, refund_id).await,
        }
    }

    /// Drop a refund claim after the gateway refused. The payment stays captured.
    pub async fn abort_refund(&self, booking_id: BookingId) -> Result<(), EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let Some(mut payment) = guard
            .payments
            .get(&booking_id)
            .filter(|p| p.status == PaymentRecordStatus::RefundPending)
            .cloned()
        else {
            return Ok(());
        };
        payment.status = PaymentRecordStatus::Completed;
        let event = Event::BookingUpdated {
            booking: current,
            payment: Some(payment),
            consumed_hold: None,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(%booking_id, "refund claim dropped");
        Ok(())
    }

    async fn settle_rejection(
        &self,
        cs: &mut CarState,
        current: Booking,
        refund_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let next = lifecycle::transition(&current, Trigger::Reject)?;
        let refunded = next == BookingStatus::Refunded;
        let booking_id = current.id;

        let mut updated = current.clone();
        updated.status = next;
        updated.updated_at = self.now();
        let payment = if refunded {
            updated.payment_status = PaymentStatus::Refunded;
            cs.payments.get(&booking_id).cloned().map(|mut p| {
                p.status = PaymentRecordStatus::Refunded;
                p.refund_id = refund_id.clone();
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
        self.persist_and_apply(cs, &event).await?;
        record_transition(&updated, current.status);

        self.notify.send(Notice::BookingRejected {
            booking_id,
            renter_id: updated.renter_id,
            car_id: updated.car_id,
            refunded,
        });
        if refunded {
            self.notify.send(Notice::RefundIssued {
                booking_id,
                renter_id: updated.renter_id,
                car_id: updated.car_id,
                amount: updated.total_price,
                refund_id,
            });
        }
        Ok(updated)
    }

    async fn settle_refund(
        &self,
        cs: &mut CarState,
        current: Booking,
        refund_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let next = lifecycle::transition(&current, Trigger::Refund)?;
        let booking_id = current.id;

        let mut updated = current.clone();
        updated.status = next;
        updated.payment_status = PaymentStatus::Refunded;
        updated.updated_at = self.now();
        let payment = cs.payments.get(&booking_id).cloned().map(|mut p| {
            p.status = PaymentRecordStatus::Refunded;
            p.refund_id = refund_id.clone();
            p
        });
        let event = Event::BookingUpdated {
            booking: updated.clone(),
            payment,
            consumed_hold: None,
        };
        self.persist_and_apply(cs, &event).await?;
        record_transition(&updated, current.status);
        self.notify.send(Notice::RefundIssued {
            booking_id,
            renter_id: updated.renter_id,
            car_id: updated.car_id,
            amount: updated.total_price,
            refund_id,
        });
        Ok(updated)
    }

    /// Withdraw a pending or confirmed booking. Money is not touched.
    pub async fn cancel(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_settled(&guard, &current, "cancel")?;
        let next = lifecycle::transition(&current, Trigger::Cancel)?;

        let mut updated = current.clone();
        updated.status = next;
        updated.updated_at = now;
        let event = Event::BookingUpdated {
            booking: updated.clone(),
            payment: None,
            consumed_hold: None,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_transition(&updated, current.status);
        self.notify.send(Notice::cancelled(&updated));
        Ok(updated)
    }

    /// Gateway captured the money for an open checkout. The booking becomes blocking,
    /// so the calendar is re-checked first; the renter's hold on the car is consumed.
    pub async fn capture_payment(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let capturable = current.status == BookingStatus::Pending
            && matches!(
                current.payment_status,
                PaymentStatus::Pending | PaymentStatus::Failed
            );
        if !capturable {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: current.status,
                action: "capture payment for",
            });
        }
        if let Some(by) = guard.blocking_conflict(&current.range, Some(booking_id)) {
            return Err(conflict(current.car_id, by));
        }

        let mut updated = current.clone();
        updated.payment_status = PaymentStatus::Paid;
        updated.updated_at = now;
        let payment = match guard.payments.get(&booking_id) {
            Some(p) => Payment {
                status: PaymentRecordStatus::Completed,
                ..p.clone()
            },
            None => Payment {
                id: Ulid::new(),
                booking_id,
                amount: updated.total_price,
                status: PaymentRecordStatus::Completed,
                refund_id: None,
                created_at: now,
            },
        };
        let consumed_hold = guard.hold_for(updated.renter_id).map(|h| h.id);
        let event = Event::BookingUpdated {
            booking: updated.clone(),
            payment: Some(payment),
            consumed_hold,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if consumed_hold.is_some() {
            metrics::counter!(HOLDS_RELEASED_TOTAL, "reason" => ReleaseReason::Converted.as_str())
                .increment(1);
        }
        tracing::info!(%booking_id, car_id = %updated.car_id, "payment captured");
        self.notify.send(Notice::payment_received(&updated));
        Ok(updated)
    }

    /// Remove a booking whose payment never went through. Paid bookings are refused.
    pub async fn delete_unpaid(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let unpaid = current.status == BookingStatus::Pending
            && matches!(
                current.payment_status,
                PaymentStatus::Pending | PaymentStatus::Failed
            );
        if !unpaid {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: current.status,
                action: "discard",
            });
        }
        let event = Event::BookingDeleted {
            id: booking_id,
            car_id: current.car_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(%booking_id, car_id = %current.car_id, "unpaid booking discarded");
        Ok(current)
    }

    /// Delete pending, unpaid bookings created before `cutoff` (abandoned checkouts).
    pub async fn clear_stale_bookings(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut cleared = 0;
        for cs in self.all_cars() {
            if !cs.read().await.bookings.iter().any(|b| is_stale(b, cutoff)) {
                continue;
            }
            let mut guard = cs.write().await;
            let stale: Vec<BookingId> = guard
                .bookings
                .iter()
                .filter(|b| is_stale(b, cutoff))
                .map(|b| b.id)
                .collect();
            for id in stale {
                let event = Event::BookingDeleted {
                    id,
                    car_id: guard.id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            metrics::counter!(STALE_BOOKINGS_CLEARED_TOTAL).increment(cleared as u64);
            tracing::info!(cleared, %cutoff, "stale unpaid bookings cleared");
        }
        Ok(cleared)
    }
}
