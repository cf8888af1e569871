//! Fixed-interval poll scheduling.
//!
//! One spawned task per poll target drives a tick callback. Scheduled ticks
//! and manual refreshes run on the same loop, so a manual refresh can never
//! overlap a tick that is already in flight. Stopping the poller drops any
//! in-flight tick at its next suspension point, so no state mutation lands
//! after teardown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a tick tells the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep polling. Transient failures report this; they are retried on
    /// the next scheduled tick.
    Continue,
    /// Stop the schedule (session invalidated).
    Stop,
}

pub struct Poller {
    alive: Arc<AtomicBool>,
    refresh: Arc<Notify>,
    stop: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Spawn the poll loop. The first tick fires immediately, then every
    /// `interval`. Exactly one tick runs at a time.
    pub fn start<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let refresh = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());

        let handle = tokio::spawn({
            let alive = alive.clone();
            let refresh = refresh.clone();
            let stop = stop.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        // Manual refresh: run a tick now without resetting
                        // the interval's phase.
                        _ = refresh.notified() => {}
                        _ = stop.notified() => break,
                    }
                    if !alive.load(Ordering::SeqCst) {
                        break;
                    }

                    let outcome = tokio::select! {
                        outcome = tick() => outcome,
                        // Teardown while the tick is in flight: drop the
                        // future before it can touch shared state again.
                        _ = stop.notified() => break,
                    };
                    if outcome == TickOutcome::Stop || !alive.load(Ordering::SeqCst) {
                        alive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                tracing::debug!("Poll loop exited");
            }
        });

        Self {
            alive,
            refresh,
            stop,
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Run a tick as soon as the current one (if any) finishes. Ignored on
    /// a stopped loop.
    pub fn refresh_now(&self) {
        if self.is_alive() {
            self.refresh.notify_one();
        }
    }

    /// Whether the loop is still scheduled to tick.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop the schedule. No tick fires after this returns, and an in-flight
    /// tick is cancelled at its next suspension point.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();
        // Wake the loop if it is parked waiting for the next tick.
        self.refresh.notify_one();
    }

    /// Stop and wait for the loop task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_tick(counter: Arc<AtomicU32>) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = TickOutcome> + Send>> {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TickOutcome::Continue
            })
        }
    }

    #[tokio::test]
    async fn test_ticks_on_schedule() {
        let counter = Arc::new(AtomicU32::new(0));
        let poller = Poller::start(Duration::from_millis(20), counting_tick(counter.clone()));

        tokio::time::sleep(Duration::from_millis(110)).await;
        let count = counter.load(Ordering::SeqCst);
        // Immediate first tick plus several scheduled ones.
        assert!(count >= 4, "expected >= 4 ticks, got {}", count);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_prevents_further_ticks() {
        let counter = Arc::new(AtomicU32::new(0));
        let poller = Poller::start(Duration::from_millis(10), counting_tick(counter.clone()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        poller.stop();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let at_stop = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), at_stop);
        assert!(!poller.is_alive());
    }

    #[tokio::test]
    async fn test_refresh_now_runs_between_scheduled_ticks() {
        let counter = Arc::new(AtomicU32::new(0));
        // Interval long enough that only the immediate tick fires on its own.
        let poller = Poller::start(Duration::from_secs(60), counting_tick(counter.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        poller.refresh_now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // No extra ticks beyond the manual one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_requesting_stop_ends_schedule() {
        let counter = Arc::new(AtomicU32::new(0));
        let poller = Poller::start(Duration::from_millis(10), {
            let counter = counter.clone();
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    // Simulates a session-invalidation signal on tick 3.
                    if n >= 2 {
                        TickOutcome::Stop
                    } else {
                        TickOutcome::Continue
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!poller.is_alive());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_tick() {
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        let poller = Poller::start(Duration::from_millis(10), {
            let started = started.clone();
            let finished = finished.clone();
            move || {
                let started = started.clone();
                let finished = finished.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    // This is the "mutate shared state" step; it must not run
                    // for a tick that was in flight at teardown.
                    finished.fetch_add(1, Ordering::SeqCst);
                    TickOutcome::Continue
                }
            }
        });

        // Let the first tick start, then tear down mid-flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        poller.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
