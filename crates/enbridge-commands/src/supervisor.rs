//! Background timeout sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::tracker::TrackerInner;

static NEXT_SUPERVISOR_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the supervisor whose sweep is running on the current task.
    static SWEEPING: u64;
}

/// Recurring task that times out expired commands.
///
/// Stopping is cooperative: a sweep already running completes, the wait for
/// the next tick is cancelled.
pub(crate) struct TimeoutSupervisor {
    id: u64,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimeoutSupervisor {
    /// Spawn the sweep loop on the current runtime.
    pub(crate) fn spawn(inner: Arc<TrackerInner>, period: Duration) -> Self {
        let id = NEXT_SUPERVISOR_ID.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {}
                }

                let expired = SWEEPING
                    .scope(id, inner.sweep_timeouts(Instant::now()))
                    .await;
                if expired > 0 {
                    tracing::debug!("Timeout sweep resolved {} command(s)", expired);
                }
            }
        });

        Self {
            id,
            shutdown_tx,
            handle,
        }
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// Called from one of this supervisor's own callbacks, it only signals:
    /// the loop exits once the current sweep returns.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        if SWEEPING.try_with(|id| *id == self.id).unwrap_or(false) {
            return;
        }

        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            tracing::error!("Timeout supervisor panicked: {}", e);
        }
    }

    /// Stop the loop without waiting.
    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}
