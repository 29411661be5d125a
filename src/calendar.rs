use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Closed interval of calendar days `[start, end]`.
///
/// Both ends are rental days: a booking for Jan 1–Jan 3 occupies the car on
/// Jan 3, so it collides with another booking starting Jan 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Single-day range.
    pub fn day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        overlaps(self, other)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn day_span(&self) -> i64 {
        day_span(self)
    }

    /// Every calendar day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start
            .iter_days()
            .take_while(move |d| *d <= end)
    }
}

pub fn overlaps(a: &DateRange, b: &DateRange) -> bool {
    a.start <= b.end && a.end >= b.start
}

pub fn day_span(r: &DateRange) -> i64 {
    (r.end - r.start).num_days() + 1
}

pub fn price_for(r: &DateRange, daily_rate: Decimal) -> Decimal {
    Decimal::from(day_span(r)) * daily_rate
}
