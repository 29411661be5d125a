//! Entry point for the checkout, payment, owner and admin handlers. Composes the
//! engine with the payment gateway; every durable change still goes through the
//! engine's guarded transitions.

use std::sync::Arc;
use std::time::Instant;

use chrono::TimeDelta;

use crate::calendar::DateRange;
use crate::engine::{Engine, EngineError};
use crate::gateway::PaymentGateway;
use crate::lifecycle::Trigger;
use crate::model::*;
use crate::observability::{
    status_label, OPERATIONS_TOTAL, OPERATION_DURATION_SECONDS, REFUNDS_TOTAL,
};

/// Who is asking. Cancels are scoped by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Renter(RenterId),
    Owner(OwnerId),
    Admin,
}

fn observe<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status_label(result)).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        tracing::debug!(op, kind = e.kind(), "{e}");
    }
}

pub struct Orchestrator {
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    hold_ttl: TimeDelta,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>, gateway: Arc<dyn PaymentGateway>, hold_ttl: TimeDelta) -> Self {
        Self {
            engine,
            gateway,
            hold_ttl,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Claim `range` on `car_id` while the renter pays. Fails with `Conflict` if a
    /// blocking booking or another renter's hold is in the way.
    pub async fn request_hold(
        &self,
        renter_id: RenterId,
        car_id: CarId,
        range: DateRange,
    ) -> Result<Hold, EngineError> {
        let started = Instant::now();
        let result = self.request_hold_inner(renter_id, car_id, range).await;
        observe("request_hold", started, &result);
        result
    }

    async fn request_hold_inner(
        &self,
        renter_id: RenterId,
        car_id: CarId,
        range: DateRange,
    ) -> Result<Hold, EngineError> {
        if !self.engine.car_info(car_id).await?.listed {
            return Err(EngineError::CarUnlisted(car_id));
        }
        if let Some(by) = self
            .engine
            .first_conflict(car_id, range, Some(renter_id))
            .await?
        {
            return Err(EngineError::Conflict { car_id, by });
        }
        self.engine
            .create_hold(renter_id, car_id, range, self.hold_ttl)
            .await
    }

    /// Payment was captured for `hold_id`: book the car. Expired holds and lost
    /// races leave no hold behind.
    pub async fn confirm_payment(&self, hold_id: HoldId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.convert(hold_id, true).await;
        observe("confirm_payment", started, &result);
        result
    }

    /// Start a two-phase checkout: an unpaid booking that blocks nothing until
    /// `capture_payment`. The hold stays in place meanwhile.
    pub async fn open_checkout(&self, hold_id: HoldId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.convert(hold_id, false).await;
        observe("open_checkout", started, &result);
        result
    }

    async fn convert(&self, hold_id: HoldId, paid: bool) -> Result<Booking, EngineError> {
        let hold = self.engine.get_hold(hold_id).await?;
        if hold.is_expired(self.engine.now()) {
            self.release_quietly(hold_id, ReleaseReason::Expired).await;
            return Err(EngineError::HoldExpired(hold_id));
        }
        match self
            .engine
            .create_from_hold(hold_id, hold.renter_id, paid)
            .await
        {
            Err(e @ EngineError::Conflict { .. }) => {
                self.release_quietly(hold_id, ReleaseReason::Abandoned).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn release_quietly(&self, hold_id: HoldId, reason: ReleaseReason) {
        match self.engine.release_hold_with(hold_id, reason).await {
            Ok(_) | Err(EngineError::NotFound(_)) => {}
            Err(e) => tracing::warn!(%hold_id, "failed to release hold: {e}"),
        }
    }

    /// Gateway capture succeeded for an open checkout.
    pub async fn capture_payment(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.engine.capture_payment(booking_id).await;
        observe("capture_payment", started, &result);
        result
    }

    /// Gateway capture failed: nothing durable should remain of the booking.
    pub async fn fail_payment(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.engine.delete_unpaid(booking_id).await;
        observe("fail_payment", started, &result);
        result
    }

    /// Owner accepts or rejects. Rejecting a paid booking refunds through the gateway
    /// first; if the gateway fails, the booking is left exactly as it was.
    pub async fn owner_decision(
        &self,
        booking_id: BookingId,
        owner_id: OwnerId,
        accept: bool,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.owner_decision_inner(booking_id, owner_id, accept).await;
        observe(if accept { "owner_accept" } else { "owner_reject" }, started, &result);
        result
    }

    async fn owner_decision_inner(
        &self,
        booking_id: BookingId,
        owner_id: OwnerId,
        accept: bool,
    ) -> Result<Booking, EngineError> {
        let booking = self.engine.get_booking(booking_id).await?;
        let car = self.engine.car_info(booking.car_id).await?;
        if car.owner_id != owner_id {
            return Err(EngineError::Forbidden {
                actor: owner_id,
                target: booking_id,
            });
        }
        if accept {
            return self.engine.accept(booking_id).await;
        }
        if booking.payment_status == PaymentStatus::Paid {
            return self
                .refund_and_settle(booking_id, Trigger::Reject, "booking rejected by owner")
                .await;
        }
        self.engine.reject_unpaid(booking_id).await
    }

    /// Renters cancel their own bookings; admins cancel any. Owners decline through
    /// `owner_decision` instead.
    pub async fn cancel(&self, booking_id: BookingId, actor: Actor) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(booking_id, actor).await;
        observe("cancel", started, &result);
        result
    }

    async fn cancel_inner(&self, booking_id: BookingId, actor: Actor) -> Result<Booking, EngineError> {
        let booking = self.engine.get_booking(booking_id).await?;
        match actor {
            Actor::Admin => {}
            Actor::Renter(id) if id == booking.renter_id => {}
            Actor::Renter(id) | Actor::Owner(id) => {
                return Err(EngineError::Forbidden {
                    actor: id,
                    target: booking_id,
                });
            }
        }
        self.engine.cancel(booking_id).await
    }

    /// Admin override: refund any paid booking through the gateway, then mark it refunded.
    pub async fn admin_refund(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.admin_refund_inner(booking_id).await;
        observe("admin_refund", started, &result);
        result
    }

    async fn admin_refund_inner(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        self.refund_and_settle(booking_id, Trigger::Refund, "refund issued by admin")
            .await
    }

    /// Claim the refund under the car lock, call the gateway, then settle with
    /// `trigger`. A gateway error drops the claim and leaves the booking as it was.
    async fn refund_and_settle(
        &self,
        booking_id: BookingId,
        trigger: Trigger,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        let payment = self.engine.begin_refund(booking_id, trigger).await?;
        let refund_id = match self.refund(&payment, reason).await {
            Ok(refund_id) => refund_id,
            Err(e) => {
                if let Err(undo) = self.engine.abort_refund(booking_id).await {
                    tracing::error!(%booking_id, "failed to drop refund claim: {undo}");
                }
                return Err(e);
            }
        };
        self.engine
            .complete_refund(booking_id, trigger, refund_id.clone())
            .await
            .inspect_err(|e| {
                tracing::error!(%booking_id, ?refund_id, "refund issued but not recorded: {e}");
            })
    }

    /// Call the gateway for one payment record.
    async fn refund(&self, payment: &Payment, reason: &str) -> Result<Option<String>, EngineError> {
        match self.gateway.refund(payment, reason).await {
            Ok(receipt) => {
                metrics::counter!(REFUNDS_TOTAL, "outcome" => "ok").increment(1);
                tracing::info!(
                    booking_id = %payment.booking_id,
                    refund_id = %receipt.refund_id,
                    amount = %payment.amount,
                    "refund issued"
                );
                Ok(Some(receipt.refund_id))
            }
            Err(e) => {
                metrics::counter!(REFUNDS_TOTAL, "outcome" => "error").increment(1);
                tracing::warn!(
                    booking_id = %payment.booking_id,
                    retryable = e.retryable,
                    "refund failed: {e}"
                );
                Err(e.into())
            }
        }
    }
}
