// Timer driver for a single arbiter instance

use crate::machine::Baton;
use std::sync::{Arc, Weak};
use tokio::{sync::oneshot, task::JoinHandle, time::sleep_until};
use tracing::debug;

/// Drives the poll, settle and renew timers of one [`Baton`].
///
/// At most one of the three timers is armed at a time, so the scheduler is a
/// single task that sleeps until the armed deadline and then hands the fire to
/// the baton. It only keeps a weak reference while sleeping: once every strong
/// reference to the baton is gone the task winds down on its own.
pub struct Scheduler;

impl Scheduler {
    pub fn spawn<B>(baton: &Arc<B>) -> SchedulerHandle
    where
        B: Baton + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(Arc::downgrade(baton), shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

async fn run<B: Baton>(baton: Weak<B>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        let armed = match baton.upgrade() {
            Some(baton) => baton.armed(),
            None => break,
        };
        let Some(armed) = armed else { break };

        tokio::select! {
            () = sleep_until(armed.deadline) => {}
            _ = &mut shutdown => break,
        }

        let Some(baton) = baton.upgrade() else { break };
        // Re-armed or disarmed while we slept
        if baton.armed() != Some(armed) {
            continue;
        }
        tokio::select! {
            () = baton.update(armed.timer) => {}
            _ = &mut shutdown => break,
        }
    }
    debug!("scheduler stopped");
}

/// Single cancellation handle covering all three timers of an instance.
///
/// Dropping the handle stops the timers too, without any of the cleanup
/// `Baton::destroy` performs.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops every timer. A fire already in flight is dropped at its next
    /// await point.
    pub fn cancel(self) {
        let _ = self.shutdown.send(());
        self.task.abort();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{ArbiterState, ArmedTimer, Timer};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::{Duration, Instant};

    /// Fires its poll timer every 100ms and records each fire.
    struct Ticker {
        fires: Mutex<Vec<Instant>>,
        next: Mutex<Option<ArmedTimer>>,
    }

    impl Ticker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fires: Mutex::new(Vec::new()),
                next: Mutex::new(Some(ArmedTimer {
                    timer: Timer::Poll,
                    deadline: Instant::now() + Duration::from_millis(100),
                })),
            })
        }
    }

    #[async_trait]
    impl Baton for Ticker {
        fn state(&self) -> ArbiterState {
            ArbiterState::Unowned
        }

        fn armed(&self) -> Option<ArmedTimer> {
            *self.next.lock()
        }

        async fn update(&self, fired: Timer) {
            let now = Instant::now();
            self.fires.lock().push(now);
            *self.next.lock() = Some(ArmedTimer {
                timer: fired,
                deadline: now + Duration::from_millis(100),
            });
        }

        async fn destroy(&self) {
            *self.next.lock() = None;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_armed_deadlines() {
        let start = Instant::now();
        let ticker = Ticker::new();
        let handle = Scheduler::spawn(&ticker);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let fires = ticker.fires.lock().clone();
        assert_eq!(fires.len(), 3);
        assert_eq!(fires[0] - start, Duration::from_millis(100));
        assert_eq!(fires[2] - start, Duration::from_millis(300));

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_all_fires() {
        let ticker = Ticker::new();
        let handle = Scheduler::spawn(&ticker);

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(ticker.fires.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_nothing_is_armed() {
        let ticker = Ticker::new();
        let handle = Scheduler::spawn(&ticker);

        ticker.destroy().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(handle.is_finished());
        assert!(ticker.fires.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_baton_dropped() {
        let ticker = Ticker::new();
        let handle = Scheduler::spawn(&ticker);

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(ticker);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(handle.is_finished());
    }
}
