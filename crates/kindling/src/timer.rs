//! Restartable backoff timer.
//!
//! A [`Timer`] wraps a callback and a [`Backoff`] schedule. Scheduling
//! cancels any pending invocation and arms the next one at the schedule
//! entry for the current attempt; firing never auto-reschedules, so the
//! callback decides whether the retry loop continues.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// An ordered retry-delay schedule whose final entry repeats indefinitely.
#[derive(Debug, Clone)]
pub struct Backoff {
    steps: Vec<Duration>,
}

impl Backoff {
    /// Build a schedule from an ordered list of delays.
    ///
    /// # Panics
    ///
    /// Panics if `steps` is empty.
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        let steps: Vec<Duration> = steps.into_iter().collect();
        assert!(!steps.is_empty(), "backoff schedule must not be empty");
        Self { steps }
    }

    /// Build a schedule from millisecond delays.
    pub fn from_millis(steps: impl IntoIterator<Item = u64>) -> Self {
        Self::new(steps.into_iter().map(Duration::from_millis))
    }

    /// The delay for a zero-based attempt, clamped to the final entry.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.steps[(attempt as usize).min(self.steps.len() - 1)]
    }

    /// Default socket reconnect schedule.
    pub fn default_reconnect() -> Self {
        Self::from_millis([10, 50, 100, 150, 200, 250, 500, 1000, 2000, 5000])
    }

    /// Default channel rejoin schedule.
    pub fn default_rejoin() -> Self {
        Self::from_millis([1000, 2000, 5000, 10_000])
    }
}

/// A restartable, cancelable scheduled callback with an attempt counter.
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    callback: Box<dyn Fn() + Send + Sync>,
    schedule: Backoff,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    tries: u32,
    pending: Option<JoinHandle<()>>,
}

impl Timer {
    /// Create a timer. Nothing is scheduled until [`Timer::schedule_timeout`].
    pub fn new(schedule: Backoff, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback: Box::new(callback),
                schedule,
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Cancel any pending invocation and reset the attempt counter.
    ///
    /// Safe to call repeatedly and from within the firing callback.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.tries = 0;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// Cancel any pending invocation and schedule the next one at the
    /// schedule entry for the current attempt, then advance the counter.
    pub fn schedule_timeout(&self) {
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let delay = self.inner.schedule.delay(state.tries);
        state.tries += 1;
        let weak = Arc::downgrade(&self.inner);
        state.pending = Some(tokio::spawn(fire_after(weak, delay)));
    }

    /// The number of attempts scheduled since the last reset.
    pub fn tries(&self) -> u32 {
        self.inner.state.lock().tries
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(pending) = self.inner.state.lock().pending.take() {
            pending.abort();
        }
    }
}

async fn fire_after(weak: Weak<TimerInner>, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner.state.lock().pending = None;
    (inner.callback)();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_clamps_to_the_final_entry() {
        let backoff = Backoff::from_millis([1000, 2000, 5000]);
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(2), Duration::from_millis(5000));
        assert_eq!(backoff.delay(3), Duration::from_millis(5000));
        assert_eq!(backoff.delay(100), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_schedule_call() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new(Backoff::from_millis([100]), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // firing does not auto-reschedule
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_the_pending_invocation() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new(Backoff::from_millis([100]), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.schedule_timeout();
        assert_eq!(timer.tries(), 1);
        timer.reset();
        assert_eq!(timer.tries(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_walks_the_backoff_schedule() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new(Backoff::from_millis([100, 200]), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // second attempt uses the second entry
        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
