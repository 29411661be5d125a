use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Booking, BookingId, CarId, RenterId};

const CHANNEL_CAPACITY: usize = 256;

/// Logical events for the notification dispatcher. The engine never formats
/// or delivers messages itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    PaymentReceived {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
        amount: Decimal,
    },
    BookingConfirmed {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
    },
    BookingRejected {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
        refunded: bool,
    },
    RefundIssued {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
        amount: Decimal,
        refund_id: Option<String>,
    },
    BookingCancelled {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
    },
    BookingCompleted {
        booking_id: BookingId,
        renter_id: RenterId,
        car_id: CarId,
    },
}

impl Notice {
    pub fn confirmed(b: &Booking) -> Self {
        Notice::BookingConfirmed {
            booking_id: b.id,
            renter_id: b.renter_id,
            car_id: b.car_id,
        }
    }

    pub fn cancelled(b: &Booking) -> Self {
        Notice::BookingCancelled {
            booking_id: b.id,
            renter_id: b.renter_id,
            car_id: b.car_id,
        }
    }

    pub fn completed(b: &Booking) -> Self {
        Notice::BookingCompleted {
            booking_id: b.id,
            renter_id: b.renter_id,
            car_id: b.car_id,
        }
    }

    pub fn payment_received(b: &Booking) -> Self {
        Notice::PaymentReceived {
            booking_id: b.id,
            renter_id: b.renter_id,
            car_id: b.car_id,
            amount: b.total_price,
        }
    }

    pub fn car_id(&self) -> CarId {
        match self {
            Notice::PaymentReceived { car_id, .. }
            | Notice::BookingConfirmed { car_id, .. }
            | Notice::BookingRejected { car_id, .. }
            | Notice::RefundIssued { car_id, .. }
            | Notice::BookingCancelled { car_id, .. }
            | Notice::BookingCompleted { car_id, .. } => *car_id,
        }
    }

    /// JSON payload handed to the dispatcher.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Broadcast hub: one firehose for the dispatcher plus optional per-car channels.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    per_car: DashMap<CarId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            per_car: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Subscribe to notices about one car. Creates the channel if needed.
    pub fn subscribe(&self, car_id: CarId) -> broadcast::Receiver<Notice> {
        self.per_car
            .entry(car_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op when nobody is listening.
    pub fn send(&self, notice: Notice) {
        if let Some(sender) = self.per_car.get(&notice.car_id()) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }
}
