//! Cancelable timers.
//!
//! Two kinds of timers are owned by a client: the periodic refetch of an active query
//! ([`spawn_interval`]) and the delayed invalidation after a failed fetch ([`spawn_delay`]).
//! Both return a [`TimerHandle`]; dropping the handle cancels the timer.

use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

/// Handle for a running timer task.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TimerHandle {
    const fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Stops the timer. A callback that is already running completes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Calls `tick` every `period`, starting one period from now.
pub fn spawn_interval(
    runtime: &Handle,
    period: Duration,
    tick: impl Fn() + Send + 'static,
) -> TimerHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let join = runtime.spawn(async move {
        // NOTE: Skip drops missed ticks instead of bursting to catch up after a stall.
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = IntervalStream::new(ticker).skip(1); // first tick is immediate

        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                tick_at = ticks.next() => {
                    if tick_at.is_none() {
                        break;
                    }
                    tick();
                }
            }
        }
    });

    TimerHandle::new(token, join)
}

/// Calls `fire` once after `delay` unless cancelled first.
pub fn spawn_delay(
    runtime: &Handle,
    delay: Duration,
    fire: impl FnOnce() + Send + 'static,
) -> TimerHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let join = runtime.spawn(async move {
        tokio::select! {
            () = cancelled.cancelled() => {}
            () = sleep(delay) => fire(),
        }
    });

    TimerHandle::new(token, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_after_each_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = spawn_interval(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "no immediate tick");

        tokio::time::sleep(Duration::from_millis(260)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = spawn_delay(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_delay() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = spawn_delay(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(handle);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
