//! Periodic expiry sweeps for in-process stores.
//!
//! Sweeping only bounds memory. Every store still checks expiry on read, so
//! a stopped or lagging sweeper never changes what callers observe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// A store whose expired entries can be dropped in one synchronous pass.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove expired entries, returning how many were removed.
    fn sweep(&self) -> usize;
}

/// Counters collected over a sweeper's lifetime.
#[derive(Debug, Default)]
pub struct SweepStats {
    pub cycles: AtomicU64,
    pub removed: AtomicU64,
}

impl SweepStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

/// Sweep `target` every `period` until `shutdown_rx` carries `true`.
pub async fn sweeper_task(
    target: Arc<dyn Sweep>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepStats> {
    let stats = Arc::new(SweepStats::default());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so a fresh store is
    // not swept at startup.
    ticker.tick().await;

    tracing::info!(
        target_store = target.name(),
        interval_ms = period.as_millis() as u64,
        "Sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let removed = target.sweep();
                stats.cycles.fetch_add(1, Ordering::Relaxed);
                stats.removed.fetch_add(removed as u64, Ordering::Relaxed);
                if removed > 0 {
                    tracing::debug!(target_store = target.name(), removed, "Swept expired entries");
                }
            }
        }
    }

    tracing::info!(
        target_store = target.name(),
        cycles = stats.cycles(),
        removed = stats.removed(),
        "Sweeper stopped"
    );
    stats
}

/// Spawn [`sweeper_task`] on the current runtime.
pub fn spawn_sweeper(
    target: Arc<dyn Sweep>,
    period: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Arc<SweepStats>> {
    tokio::spawn(sweeper_task(target, period, shutdown_rx))
}
