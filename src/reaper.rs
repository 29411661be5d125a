use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::info;

use crate::engine::{AdvanceScope, Engine, EngineError};

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub holds_expired: usize,
    pub bookings_advanced: usize,
    pub stale_cleared: usize,
}

/// One maintenance pass: purge expired holds, advance every booking to today,
/// drop unpaid bookings older than `stale_after`. Reads advance on their own,
/// so this only keeps idle cars tidy.
pub async fn sweep(engine: &Engine, stale_after: TimeDelta) -> Result<SweepReport, EngineError> {
    let now = engine.now();
    Ok(SweepReport {
        holds_expired: engine.purge_expired(now).await?,
        bookings_advanced: engine.advance(AdvanceScope::All, engine.today()).await?,
        stale_cleared: engine.clear_stale_bookings(now - stale_after).await?,
    })
}

/// Background task that runs `sweep` on a fixed interval.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, stale_after: TimeDelta) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match sweep(&engine, stale_after).await {
            Ok(report) if report != SweepReport::default() => info!(
                holds_expired = report.holds_expired,
                bookings_advanced = report.bookings_advanced,
                stale_cleared = report.stale_cleared,
                "sweep"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("sweep failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(appends, "WAL compaction failed: {e}");
        }
    }
}
