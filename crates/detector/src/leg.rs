//! A leg: one phase-shifted probe that sleeps to its next checkpoint and
//! reports how far past it the clock actually was.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use telemetry::DetectorMetrics;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Expected wake time of a leg.
///
/// Checkpoints only ever move by whole periods from the leg's start, so two
/// legs started half a period apart stay half a period apart no matter how
/// many drifts they observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    expected: SystemTime,
    period: Duration,
}

impl Checkpoint {
    /// First checkpoint, one period after `start`. `period` must be positive.
    pub fn new(start: SystemTime, period: Duration) -> Self {
        Self { expected: start + period, period }
    }

    /// When the leg expects to wake next.
    pub const fn expected(&self) -> SystemTime {
        self.expected
    }

    /// Account for a wake at `now` and move to the next checkpoint.
    ///
    /// Returns the drift `now - expected` when it exceeds `margin`; the
    /// checkpoint then skips ahead to the first grid point after `now`.
    /// Otherwise the checkpoint moves by exactly one period.
    pub fn observe(&mut self, now: SystemTime, margin: Duration) -> Option<Duration> {
        let late = now.duration_since(self.expected).unwrap_or(Duration::ZERO);
        if late > margin {
            let cycles = late.as_nanos() / self.period.as_nanos();
            self.expected += from_nanos(self.period.as_nanos() * (cycles + 1));
            Some(late)
        } else {
            self.expected += self.period;
            None
        }
    }
}

fn from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    let subsec = u32::try_from(nanos % NANOS_PER_SEC).unwrap_or(0);
    Duration::new(secs, subsec)
}

/// Everything a running leg owns.
pub(crate) struct Leg {
    pub(crate) index: u32,
    pub(crate) start_at: SystemTime,
    pub(crate) period: Duration,
    pub(crate) margin: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) reports: mpsc::Sender<Duration>,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: DetectorMetrics,
}

impl Leg {
    pub(crate) async fn run(self) {
        // phase alignment
        if !self.sleep_until(self.start_at).await {
            return;
        }
        let mut checkpoint = Checkpoint::new(self.start_at, self.period);
        loop {
            if !self.sleep_until(checkpoint.expected()).await {
                return;
            }
            let now = self.clock.now();
            if let Some(drift) = checkpoint.observe(now, self.margin) {
                debug!(leg = self.index, drift = ?drift, "woke past checkpoint");
                let sent = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return,
                    sent = self.reports.send(drift) => sent,
                };
                if sent.is_err() {
                    // merge stage is gone
                    return;
                }
                self.metrics.record_raw_report();
            } else {
                trace!(leg = self.index, "checkpoint on time");
            }
            if self.cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Sleep until the clock reads `at`, going back to sleep after early
    /// wakes. Returns false once cancelled.
    async fn sleep_until(&self, at: SystemTime) -> bool {
        loop {
            let remaining = self.clock.remaining_until(at);
            if remaining.is_zero() {
                return !self.cancel.is_cancelled();
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = self.clock.sleep(remaining) => {}
            }
        }
    }
}
