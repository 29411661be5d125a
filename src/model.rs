use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::DateRange;
use crate::limits::{LAPSED_HOLD_RETENTION_HOURS, MAX_LAPSED_HOLDS_PER_CAR};

pub type CarId = Ulid;
pub type OwnerId = Ulid;
pub type RenterId = Ulid;
pub type HoldId = Ulid;
pub type BookingId = Ulid;
pub type PaymentId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Ongoing,
    Completed,
    Cancelled,
    Rejected,
    Refunded,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::Rejected
                | BookingStatus::Refunded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Ongoing => "ongoing",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment state as seen from the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// State of the payment record itself (gateway side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentRecordStatus {
    Pending,
    Completed,
    /// A gateway refund has been claimed and is in flight.
    RefundPending,
    Failed,
    Refunded,
}

/// Why a hold left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    Converted,
    Superseded,
    Expired,
    Abandoned,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Converted => "converted",
            ReleaseReason::Superseded => "superseded",
            ReleaseReason::Expired => "expired",
            ReleaseReason::Abandoned => "abandoned",
        }
    }
}

/// Soft, time-boxed claim on a car while the renter pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub renter_id: RenterId,
    pub car_id: CarId,
    pub range: DateRange,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub renter_id: RenterId,
    pub car_id: CarId,
    pub range: DateRange,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub total_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Whether this booking occupies the car's calendar.
    pub fn is_blocking(&self) -> bool {
        is_blocking(self.status, self.payment_status)
    }
}

pub fn is_blocking(status: BookingStatus, payment: PaymentStatus) -> bool {
    match status {
        BookingStatus::Confirmed | BookingStatus::Ongoing => true,
        BookingStatus::Pending => payment == PaymentStatus::Paid,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub status: PaymentRecordStatus,
    pub refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the engine tracks for one car. Guarded by a single lock.
#[derive(Debug, Clone)]
pub struct CarState {
    pub id: CarId,
    pub owner_id: OwnerId,
    pub daily_rate: Decimal,
    pub listed: bool,
    /// Sorted by `range.start`.
    pub bookings: Vec<Booking>,
    pub holds: Vec<Hold>,
    /// Holds dropped on expiry, kept for a while so late callers learn why.
    pub lapsed_holds: HashMap<HoldId, Hold>,
    /// Keyed by booking id.
    pub payments: HashMap<BookingId, Payment>,
}

impl CarState {
    pub fn new(id: CarId, owner_id: OwnerId, daily_rate: Decimal, listed: bool) -> Self {
        Self {
            id,
            owner_id,
            daily_rate,
            listed,
            bookings: Vec::new(),
            holds: Vec::new(),
            lapsed_holds: HashMap::new(),
            payments: HashMap::new(),
        }
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        self.payments.remove(&id);
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose range overlaps `query`. Skips everything starting after `query.end`.
    pub fn overlapping_bookings(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start <= query.end);
        let start = query.start;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= start)
    }

    /// First blocking booking overlapping `range`, other than `exclude`.
    pub fn blocking_conflict(&self, range: &DateRange, exclude: Option<BookingId>) -> Option<BookingId> {
        self.overlapping_bookings(range)
            .filter(|b| Some(b.id) != exclude)
            .find(|b| b.is_blocking())
            .map(|b| b.id)
    }

    pub fn hold(&self, id: HoldId) -> Option<&Hold> {
        self.holds.iter().find(|h| h.id == id)
    }

    pub fn hold_for(&self, renter_id: RenterId) -> Option<&Hold> {
        self.holds.iter().find(|h| h.renter_id == renter_id)
    }

    pub fn insert_hold(&mut self, hold: Hold) {
        self.holds.push(hold);
    }

    pub fn remove_hold(&mut self, id: HoldId) -> Option<Hold> {
        let pos = self.holds.iter().position(|h| h.id == id)?;
        Some(self.holds.remove(pos))
    }

    pub fn lapsed_hold(&self, id: HoldId) -> Option<&Hold> {
        self.lapsed_holds.get(&id)
    }

    /// Record an expired hold. Returns the ids of older entries that aged out.
    pub fn remember_lapsed(&mut self, hold: Hold) -> Vec<HoldId> {
        let horizon = hold.expires_at - TimeDelta::hours(LAPSED_HOLD_RETENTION_HOURS);
        let mut dropped: Vec<HoldId> = self
            .lapsed_holds
            .values()
            .filter(|h| h.expires_at < horizon)
            .map(|h| h.id)
            .collect();
        for id in &dropped {
            self.lapsed_holds.remove(id);
        }
        if self.lapsed_holds.len() >= MAX_LAPSED_HOLDS_PER_CAR
            && let Some(oldest) = self
                .lapsed_holds
                .values()
                .min_by_key(|h| h.expires_at)
                .map(|h| h.id)
        {
            self.lapsed_holds.remove(&oldest);
            dropped.push(oldest);
        }
        self.lapsed_holds.insert(hold.id, hold);
        dropped
    }

    /// Whether a gateway refund for `booking_id` has been claimed but not settled.
    pub fn refund_in_flight(&self, booking_id: BookingId) -> bool {
        self.payments
            .get(&booking_id)
            .is_some_and(|p| p.status == PaymentRecordStatus::RefundPending)
    }

    /// First live hold overlapping `range` that isn't owned by `exclude_renter`.
    pub fn hold_conflict(
        &self,
        range: &DateRange,
        exclude_renter: Option<RenterId>,
        now: DateTime<Utc>,
    ) -> Option<HoldId> {
        self.holds
            .iter()
            .filter(|h| !h.is_expired(now))
            .filter(|h| Some(h.renter_id) != exclude_renter)
            .find(|h| h.range.overlaps(range))
            .map(|h| h.id)
    }

    pub fn expired_holds(&self, now: DateTime<Utc>) -> Vec<HoldId> {
        self.holds
            .iter()
            .filter(|h| h.is_expired(now))
            .map(|h| h.id)
            .collect()
    }

    pub fn info(&self) -> CarInfo {
        CarInfo {
            id: self.id,
            owner_id: self.owner_id,
            daily_rate: self.daily_rate,
            listed: self.listed,
        }
    }
}

/// The WAL record format. Each record is one atomic state change on one car.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CarRegistered {
        id: CarId,
        owner_id: OwnerId,
        daily_rate: Decimal,
        listed: bool,
    },
    CarUpdated {
        id: CarId,
        daily_rate: Decimal,
        listed: bool,
    },
    HoldPlaced {
        hold: Hold,
    },
    HoldReleased {
        id: HoldId,
        car_id: CarId,
        reason: ReleaseReason,
    },
    /// New booking, with its payment record and the hold it consumed (if any).
    BookingCreated {
        booking: Booking,
        payment: Option<Payment>,
        consumed_hold: Option<HoldId>,
    },
    /// Full snapshot of a booking after a transition.
    BookingUpdated {
        booking: Booking,
        payment: Option<Payment>,
        consumed_hold: Option<HoldId>,
    },
    BookingDeleted {
        id: BookingId,
        car_id: CarId,
    },
}

impl Event {
    pub fn car_id(&self) -> CarId {
        match self {
            Event::CarRegistered { id, .. } | Event::CarUpdated { id, .. } => *id,
            Event::HoldPlaced { hold } => hold.car_id,
            Event::BookingCreated { booking, .. } | Event::BookingUpdated { booking, .. } => {
                booking.car_id
            }
            Event::HoldReleased { car_id, .. } | Event::BookingDeleted { car_id, .. } => *car_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarInfo {
    pub id: CarId,
    pub owner_id: OwnerId,
    pub daily_rate: Decimal,
    pub listed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn booking(start: u32, end: u32, status: BookingStatus, payment: PaymentStatus) -> Booking {
        let now = Utc::now();
        Booking {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            car_id: Ulid::nil(),
            range: DateRange::new(d(start), d(end)).unwrap(),
            status,
            payment_status: payment,
            total_price: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    fn car() -> CarState {
        CarState::new(Ulid::nil(), Ulid::new(), Decimal::from(50), true)
    }

    #[test]
    fn blocking_matrix() {
        use BookingStatus::*;
        use PaymentStatus as P;
        assert!(is_blocking(Confirmed, P::Pending));
        assert!(is_blocking(Ongoing, P::Paid));
        assert!(is_blocking(Pending, P::Paid));
        assert!(!is_blocking(Pending, P::Pending));
        assert!(!is_blocking(Pending, P::Failed));
        for s in [Completed, Cancelled, Rejected, Refunded] {
            assert!(!is_blocking(s, P::Paid), "{s} must not block");
        }
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut cs = car();
        cs.insert_booking(booking(20, 22, BookingStatus::Confirmed, PaymentStatus::Paid));
        cs.insert_booking(booking(1, 3, BookingStatus::Confirmed, PaymentStatus::Paid));
        cs.insert_booking(booking(10, 12, BookingStatus::Confirmed, PaymentStatus::Paid));
        let starts: Vec<_> = cs.bookings.iter().map(|b| b.range.start).collect();
        assert_eq!(starts, vec![d(1), d(10), d(20)]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cs = car();
        cs.insert_booking(booking(1, 3, BookingStatus::Confirmed, PaymentStatus::Paid));
        cs.insert_booking(booking(9, 11, BookingStatus::Confirmed, PaymentStatus::Paid));
        cs.insert_booking(booking(25, 28, BookingStatus::Confirmed, PaymentStatus::Paid));
        let query = DateRange::new(d(10), d(15)).unwrap();
        let hits: Vec<_> = cs.overlapping_bookings(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range.start, d(9));
    }

    #[test]
    fn blocking_conflict_ignores_non_blocking_and_excluded() {
        let mut cs = car();
        let unpaid = booking(5, 8, BookingStatus::Pending, PaymentStatus::Pending);
        let paid = booking(5, 8, BookingStatus::Pending, PaymentStatus::Paid);
        let paid_id = paid.id;
        cs.insert_booking(unpaid);
        cs.insert_booking(paid);
        let query = DateRange::new(d(8), d(9)).unwrap();
        assert_eq!(cs.blocking_conflict(&query, None), Some(paid_id));
        assert_eq!(cs.blocking_conflict(&query, Some(paid_id)), None);
    }

    #[test]
    fn remove_booking_drops_payment() {
        let mut cs = car();
        let b = booking(5, 8, BookingStatus::Pending, PaymentStatus::Paid);
        let id = b.id;
        cs.insert_booking(b);
        cs.payments.insert(
            id,
            Payment {
                id: Ulid::new(),
                booking_id: id,
                amount: Decimal::from(200),
                status: PaymentRecordStatus::Completed,
                refund_id: None,
                created_at: Utc::now(),
            },
        );
        assert!(cs.remove_booking(id).is_some());
        assert!(cs.payments.is_empty());
        assert!(cs.remove_booking(id).is_none());
    }

    #[test]
    fn hold_conflict_skips_expired_and_own() {
        let mut cs = car();
        let now = Utc::now();
        let renter = Ulid::new();
        let range = DateRange::new(d(10), d(12)).unwrap();
        cs.insert_hold(Hold {
            id: Ulid::new(),
            renter_id: renter,
            car_id: cs.id,
            range,
            expires_at: now + chrono::TimeDelta::minutes(10),
            created_at: now,
        });
        cs.insert_hold(Hold {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            car_id: cs.id,
            range,
            expires_at: now - chrono::TimeDelta::minutes(1),
            created_at: now,
        });
        assert!(cs.hold_conflict(&range, Some(renter), now).is_none());
        assert!(cs.hold_conflict(&range, None, now).is_some());
        assert_eq!(cs.expired_holds(now).len(), 1);
    }

    #[test]
    fn lapsed_holds_age_out() {
        let mut cs = car();
        let now = Utc::now();
        let lapsed = |expires_at| Hold {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            car_id: Ulid::nil(),
            range: DateRange::new(d(10), d(12)).unwrap(),
            expires_at,
            created_at: expires_at - TimeDelta::minutes(15),
        };
        let old = lapsed(now - TimeDelta::hours(LAPSED_HOLD_RETENTION_HOURS + 1));
        let old_id = old.id;
        assert!(cs.remember_lapsed(old).is_empty());

        let recent = lapsed(now);
        let recent_id = recent.id;
        assert_eq!(cs.remember_lapsed(recent), vec![old_id]);
        assert!(cs.lapsed_hold(old_id).is_none());
        assert!(cs.lapsed_hold(recent_id).is_some());
    }
}
