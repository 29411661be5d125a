pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod reaper;
pub mod wal;

pub use calendar::DateRange;
pub use engine::{AdvanceScope, Engine, EngineError};
pub use orchestrator::{Actor, Orchestrator};
