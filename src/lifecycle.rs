//! Booking state machine. Pure functions; the engine applies the result under
//! the car's write lock.

use chrono::NaiveDate;

use crate::engine::EngineError;
use crate::model::{Booking, BookingStatus, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Accept,
    Reject,
    Cancel,
    Refund,
    Start,
    Finish,
}

impl Trigger {
    pub fn action(self) -> &'static str {
        match self {
            Trigger::Accept => "accept",
            Trigger::Reject => "reject",
            Trigger::Cancel => "cancel",
            Trigger::Refund => "refund",
            Trigger::Start => "start",
            Trigger::Finish => "complete",
        }
    }
}

/// Target status for `trigger`, or `None` when the transition is not allowed.
pub fn next_status(
    status: BookingStatus,
    payment: PaymentStatus,
    trigger: Trigger,
) -> Option<BookingStatus> {
    use BookingStatus::*;
    match (trigger, status) {
        (Trigger::Accept, Pending) => Some(Confirmed),
        (Trigger::Reject, Pending) if payment == PaymentStatus::Paid => Some(Refunded),
        (Trigger::Reject, Pending) => Some(Rejected),
        (Trigger::Cancel, Pending | Confirmed) => Some(Cancelled),
        (Trigger::Refund, s) if payment == PaymentStatus::Paid && s != Refunded => Some(Refunded),
        (Trigger::Start, Confirmed) => Some(Ongoing),
        (Trigger::Finish, Confirmed | Ongoing) => Some(Completed),
        _ => None,
    }
}

pub fn transition(booking: &Booking, trigger: Trigger) -> Result<BookingStatus, EngineError> {
    next_status(booking.status, booking.payment_status, trigger).ok_or(
        EngineError::InvalidState {
            id: booking.id,
            status: booking.status,
            action: trigger.action(),
        },
    )
}

/// The calendar-driven trigger due on `today`, if any. Finishing wins over
/// starting so a booking that was never observed as ongoing still completes.
pub fn due_trigger(booking: &Booking, today: NaiveDate) -> Option<Trigger> {
    if booking.range.end < today {
        Some(Trigger::Finish)
    } else if booking.range.contains(today) {
        Some(Trigger::Start)
    } else {
        None
    }
}

/// Status the calendar moves `booking` to on `today`, if any.
pub fn due_transition(booking: &Booking, today: NaiveDate) -> Option<BookingStatus> {
    let trigger = due_trigger(booking, today)?;
    next_status(booking.status, booking.payment_status, trigger)
}
