use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::gateway::GatewayError;
use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    /// The dates are taken. `by` is the booking or hold in the way.
    #[error("car {car_id} is not free for the requested dates (held by {by})")]
    Conflict { car_id: Ulid, by: Ulid },
    #[error("hold {0} has expired")]
    HoldExpired(Ulid),
    #[error("cannot {action} booking {id}: status is {status}")]
    InvalidState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("actor {actor} may not act on {target}")]
    Forbidden { actor: Ulid, target: Ulid },
    #[error("car {0} is not listed")]
    CarUnlisted(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::Conflict { .. } => "conflict",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Gateway(_) => "gateway",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::CarUnlisted(_) => "car_unlisted",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
