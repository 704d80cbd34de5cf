//! Timeout Sweeper - marks services down when their heartbeats go silent
//!
//! The sweep interval and the staleness threshold are independent settings.
//! Each tick takes the registry's write lock once and applies the whole
//! batch, so a sweep never interleaves with a heartbeat for the same service.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{HealthRegistry, SweepOutcome};

/// Periodic staleness detector over a [`HealthRegistry`]
#[derive(Debug, Clone)]
pub struct TimeoutSweeper {
    registry: Arc<HealthRegistry>,
    /// Silence longer than this marks a service down
    threshold: Duration,
    /// Time between sweeps
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(registry: Arc<HealthRegistry>, threshold: Duration, interval: Duration) -> Self {
        Self {
            registry,
            threshold,
            interval,
        }
    }

    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep against the current wall clock.
    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(Utc::now())
    }

    /// Run one sweep as if the time were `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let threshold =
            chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::MAX);
        let outcome = self.registry.mark_stale(now, threshold);
        for record in &outcome.newly_down {
            warn!(
                service = %record.name,
                last_heartbeat = %record.last_heartbeat,
                uptime = record.uptime_percent,
                "Service marked down - heartbeat timeout"
            );
        }
        outcome
    }

    /// Sweep every `interval` until `cancel` fires, handing each outcome to
    /// `on_sweep`. The first sweep happens one interval after start.
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_sweep: F)
    where
        F: FnMut(SweepOutcome) + Send,
    {
        info!(
            threshold_secs = self.threshold.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Timeout sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Timeout sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let outcome = self.sweep();
                    if outcome.is_empty() {
                        debug!(services = self.registry.len(), "Sweep found nothing stale");
                    } else {
                        on_sweep(outcome);
                    }
                }
            }
        }
    }
}
