//! Merge/filter stage: folds the legs' raw drift reports of one wake into a
//! single event.

use crate::clock::Clock;
use crate::LEG_COUNT;
use std::sync::Arc;
use std::time::Duration;
use telemetry::DetectorMetrics;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An emitted event and the acknowledgement the consumer sends when it takes
/// the value off the stream.
pub(crate) type Delivery = (Duration, oneshot::Sender<()>);

/// Added to half a period when waiting for the second leg's report.
pub const PAIRING_GRACE: Duration = Duration::from_millis(100);

/// How long a first report waits for its partner. Two legs report the same
/// wake at most half a period apart.
pub fn pairing_timeout(period: Duration) -> Duration {
    period / LEG_COUNT + PAIRING_GRACE
}

/// Mean of two leg reports; cancels out each leg's phase offset.
pub fn mean(a: Duration, b: Duration) -> Duration {
    (a + b) / 2
}

pub(crate) struct Merge {
    pub(crate) reports: mpsc::Receiver<Duration>,
    pub(crate) events: mpsc::Sender<Delivery>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timeout: Duration,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: DetectorMetrics,
}

impl Merge {
    pub(crate) async fn run(mut self) {
        loop {
            let first = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                first = self.reports.recv() => match first {
                    Some(first) => first,
                    // both legs stopped
                    None => return,
                },
            };
            let Some(wake) = self.pair(first).await else {
                return;
            };
            info!(slept = ?wake, "wake detected");
            // hand-off completes only once the consumer has read the event
            let (ack_tx, ack_rx) = oneshot::channel();
            let delivered = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                delivered = async {
                    self.events.send((wake, ack_tx)).await.is_ok() && ack_rx.await.is_ok()
                } => delivered,
            };
            if !delivered {
                debug!("event consumer dropped");
                return;
            }
        }
    }

    /// Race a second report against the pairing timer. None once cancelled.
    async fn pair(&mut self, first: Duration) -> Option<Duration> {
        let deadline = self.clock.after(self.timeout);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            second = self.reports.recv() => {
                if let Some(second) = second {
                    self.metrics.record_paired_event();
                    Some(mean(first, second))
                } else {
                    self.metrics.record_single_leg_event();
                    Some(first)
                }
            }
            _ = deadline => {
                debug!(report = ?first, "only one leg reported");
                self.metrics.record_single_leg_event();
                Some(first)
            }
        }
    }
}
