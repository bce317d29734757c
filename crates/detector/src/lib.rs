//! Sleep/wake detection from wall-clock drift.
//!
//! A [`Detector`] runs two legs that wake at checkpoints half a period out of
//! phase. A leg that wakes further past its checkpoint than the configured
//! margin reports the drift; the merge stage folds the reports of one wake
//! into a single event on the [`WakeEvents`] stream. Nothing here asks the OS
//! about power state: a debugger pause or a starved scheduler looks the same
//! as a suspend.

#![deny(unsafe_code)]

pub mod clock;
pub mod leg;
pub mod merge;

use clock::{Clock, SystemClock};
use leg::Leg;
use merge::{pairing_timeout, Delivery, Merge};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use telemetry::{DetectorMetrics, MetricsSnapshot};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub use wake_core::config::DetectorConfig;

/// Number of phase-shifted legs. The merge stage pairs reports, so this is
/// fixed rather than configurable.
pub const LEG_COUNT: u32 = 2;

/// Owns one detection session: its legs, merge stage and supervisor.
pub struct Detector {
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    metrics: DetectorMetrics,
    session: String,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Detector {
    /// Detector on the system clock. Checkpoints are `period` apart per leg,
    /// so the effective response time is half of it; wakes later than
    /// `margin` past a checkpoint are events. `period` must be positive.
    pub fn new(period: Duration, margin: Duration) -> Self {
        Self::from_config(DetectorConfig::new(period, margin))
    }

    /// Detector on the system clock from a loaded config.
    pub fn from_config(config: DetectorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Detector driven by `clock`; tests pass a [`clock::VirtualClock`].
    pub fn with_clock(config: DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            cancel: CancellationToken::new(),
            metrics: DetectorMetrics::new(),
            session: wake_core::session::new_session_id(),
            tasks: Vec::new(),
            started: false,
        }
    }

    /// Timing this detector was built with.
    pub const fn config(&self) -> DetectorConfig {
        self.config
    }

    /// Session id carried by this detector's tracing spans.
    pub fn session_id(&self) -> &str {
        &self.session
    }

    /// Current report and event counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Spawn the legs and merge stage and return the event stream.
    ///
    /// A detector runs once: calling `start` again returns a stream that is
    /// already closed.
    ///
    /// # Panics
    /// Outside a tokio runtime.
    pub fn start(&mut self) -> WakeEvents {
        // capacity 1 is only the hand-off slot; the merge stage waits for the
        // consumer's ack before pairing the next wake
        let (events_tx, events_rx) = mpsc::channel(1);
        let events = WakeEvents { rx: events_rx, cancel: self.cancel.clone() };
        if self.started {
            warn!(session = %self.session, "detector already started");
            return events;
        }
        self.started = true;

        let span = info_span!("wake.detector", session = %self.session);
        let period = self.config.period;
        let (reports_tx, reports_rx) = mpsc::channel(LEG_COUNT as usize);

        let merge = Merge {
            reports: reports_rx,
            events: events_tx,
            clock: self.clock.clone(),
            timeout: pairing_timeout(period),
            cancel: self.cancel.clone(),
            metrics: self.metrics.clone(),
        };
        self.tasks.push(tokio::spawn(merge.run().instrument(info_span!(parent: &span, "wake.merge"))));

        let base = self.clock.now();
        let phase = period / LEG_COUNT;
        let mut legs = JoinSet::new();
        for index in 0..LEG_COUNT {
            let leg = Leg {
                index,
                start_at: base + phase * index,
                period,
                margin: self.config.margin,
                clock: self.clock.clone(),
                reports: reports_tx.clone(),
                cancel: self.cancel.clone(),
                metrics: self.metrics.clone(),
            };
            legs.spawn(leg.run().instrument(info_span!(parent: &span, "wake.leg", leg = index)));
        }
        // the queue closes once every leg has dropped its sender
        drop(reports_tx);
        self.tasks
            .push(tokio::spawn(supervise(legs).instrument(info_span!(parent: &span, "wake.supervisor"))));

        info!(parent: &span, period = ?period, margin = ?self.config.margin, "detector started");
        events
    }

    /// Cancel every task, wait for all of them, and leave the event stream
    /// closed. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(session = %self.session, error = %e, "detector task failed");
            }
        }
        debug!(session = %self.session, "detector stopped");
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(mut legs: JoinSet<()>) {
    while let Some(res) = legs.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "leg task failed");
        }
    }
    debug!("all legs stopped");
}

/// Detected sleep lengths, one per wake, in detection order.
///
/// Unbuffered: the detector does not pair the next wake until the current
/// event has been read. Yields `None` once the detector stops, even if an
/// event was waiting to be read.
#[derive(Debug)]
pub struct WakeEvents {
    rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl WakeEvents {
    /// Next detected sleep length, or `None` once the detector has stopped.
    pub async fn recv(&mut self) -> Option<Duration> {
        self.next().await
    }
}

impl Stream for WakeEvents {
    type Item = Duration;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Duration>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some((slept, ack)) => {
                // the merge stage may already be gone
                let _ = ack.send(());
                Poll::Ready(Some(slept))
            }
            None => Poll::Ready(None),
        }
    }
}
