//! Time service: async Clock trait, a pass-through system clock, and a
//! virtual clock whose time only moves when a driver advances it.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, Notify};

/// Clock abstraction all detection timing is written against.
///
/// Durations cannot be negative: `remaining_until` of a past instant and
/// `elapsed_since` of a future one saturate to zero, and `sleep` of a zero
/// duration returns without suspending.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Time elapsed since `t`.
    fn elapsed_since(&self, t: SystemTime) -> Duration {
        self.now().duration_since(t).unwrap_or(Duration::ZERO)
    }

    /// Time left until `t`.
    fn remaining_until(&self, t: SystemTime) -> Duration {
        t.duration_since(self.now()).unwrap_or(Duration::ZERO)
    }

    /// Suspend the calling task for `d`.
    async fn sleep(&self, d: Duration);

    /// One-shot deadline `d` from now; the returned timer yields the clock's
    /// time once the deadline is reached.
    fn after(&self, d: Duration) -> Timer;
}

/// Single-fire deadline notification returned by [`Clock::after`].
pub struct Timer {
    fired: Pin<Box<dyn Future<Output = SystemTime> + Send>>,
}

impl Timer {
    /// Wrap a future that resolves when the deadline fires.
    pub fn new<F>(fired: F) -> Self
    where
        F: Future<Output = SystemTime> + Send + 'static,
    {
        Self { fired: Box::pin(fired) }
    }
}

impl Future for Timer {
    type Output = SystemTime;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SystemTime> {
        self.fired.as_mut().poll(cx)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").finish_non_exhaustive()
    }
}

/// System (production) clock. Wall time from `SystemTime`, waits on the
/// tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        tokio::time::sleep(d).await;
    }

    fn after(&self, d: Duration) -> Timer {
        let deadline = tokio::time::Instant::now() + d;
        Timer::new(async move {
            tokio::time::sleep_until(deadline).await;
            SystemTime::now()
        })
    }
}

/// Seconds since the UNIX epoch at which [`VirtualClock::new`] starts
/// (2025-01-01T12:00:00Z).
pub const VIRTUAL_EPOCH_SECS: u64 = 1_735_732_800;

struct PendingTimer {
    deadline: SystemTime,
    fire: oneshot::Sender<SystemTime>,
}

struct VirtualState {
    now: SystemTime,
    sleepers: Vec<oneshot::Sender<()>>,
    // sorted by deadline
    timers: Vec<PendingTimer>,
}

impl VirtualState {
    // Waiters that were dropped (cancelled) never fire; forget them.
    fn prune(&mut self) {
        self.sleepers.retain(|s| !s.is_closed());
        self.timers.retain(|t| !t.fire.is_closed());
    }
}

/// Virtual (deterministic) clock with manual control.
///
/// `sleep` does not wait for the requested duration of virtual time: a
/// sleeping task is released by the next [`VirtualClock::advance`] of any
/// size, and must re-check the time itself. That makes the clock a barrier
/// the test driver controls, which is what [`VirtualClock::wait_for_sleepers`]
/// relies on.
pub struct VirtualClock {
    state: Mutex<VirtualState>,
    changed: Notify,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("VirtualClock")
            .field("now", &st.now)
            .field("sleepers", &st.sleepers.len())
            .field("timers", &st.timers.len())
            .finish()
    }
}

impl VirtualClock {
    /// Create a virtual clock at [`VIRTUAL_EPOCH_SECS`].
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH + Duration::from_secs(VIRTUAL_EPOCH_SECS))
    }

    /// Create a virtual clock reading `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: start,
                sleepers: Vec::new(),
                timers: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().expect("virtual clock poisoned")
    }

    /// Move virtual time forward by `delta`, releasing every current sleeper
    /// and firing every timer whose deadline has been reached.
    pub fn advance(&self, delta: Duration) {
        {
            let mut st = self.lock();
            st.now += delta;
            let now = st.now;
            for sleeper in st.sleepers.drain(..) {
                let _ = sleeper.send(());
            }
            let due = st.timers.partition_point(|t| t.deadline <= now);
            for timer in st.timers.drain(..due) {
                let _ = timer.fire.send(now);
            }
        }
        self.changed.notify_waiters();
    }

    /// Number of tasks currently blocked in `sleep`.
    pub fn sleeper_count(&self) -> usize {
        let mut st = self.lock();
        st.prune();
        st.sleepers.len()
    }

    /// Number of registered timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        let mut st = self.lock();
        st.prune();
        st.timers.len()
    }

    /// Block until at least `n` tasks are blocked in `sleep`.
    pub async fn wait_for_sleepers(&self, n: usize) {
        self.wait_until(|st| st.sleepers.len() >= n).await;
    }

    /// Block until at least `n` timers are pending.
    pub async fn wait_for_timers(&self, n: usize) {
        self.wait_until(|st| st.timers.len() >= n).await;
    }

    async fn wait_until<F>(&self, ready: F)
    where
        F: Fn(&VirtualState) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let done = {
                let mut st = self.lock();
                st.prune();
                ready(&*st)
            };
            if done {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> SystemTime {
        self.lock().now
    }

    async fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.lock().sleepers.push(tx);
        self.changed.notify_waiters();
        // Err only if the clock itself went away.
        let _ = rx.await;
    }

    fn after(&self, d: Duration) -> Timer {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.lock();
            if d.is_zero() {
                let _ = tx.send(st.now);
            } else {
                let deadline = st.now + d;
                let at = st.timers.partition_point(|t| t.deadline <= deadline);
                st.timers.insert(at, PendingTimer { deadline, fire: tx });
            }
        }
        self.changed.notify_waiters();
        Timer::new(async move {
            match rx.await {
                Ok(at) => at,
                Err(_) => std::future::pending().await,
            }
        })
    }
}
