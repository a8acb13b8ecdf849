//! Timed admission gate: at most `limit` acquisitions per rolling window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

/// Returned by [`TimesPerWindow::acquire`] once the gate has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission gate is closed")]
pub struct GateClosed;

/// An admission gate allowing `limit` acquisitions per `window`.
///
/// Every successful acquisition schedules its own release timer `window`
/// later, so capacity replenishes even when nobody is waiting. Waiters are
/// admitted strictly FIFO.
#[derive(Debug)]
pub struct TimesPerWindow {
    limit: u32,
    window: Duration,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    remaining: u32,
    queue: VecDeque<oneshot::Sender<Result<(), GateClosed>>>,
    closed: bool,
    epoch: u64,
}

impl TimesPerWindow {
    /// Create a gate admitting `limit` acquisitions per `window`.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            inner: Arc::new(Mutex::new(Inner {
                remaining: limit,
                queue: VecDeque::new(),
                closed: false,
                epoch: 0,
            })),
        }
    }

    /// Maximum acquisitions per window.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Slots currently available without waiting.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.inner.lock().remaining
    }

    /// Wait for a slot. The slot is released automatically `window` later.
    ///
    /// # Errors
    ///
    /// Returns [`GateClosed`] if the gate is closed before a slot frees up.
    pub async fn acquire(&self) -> Result<(), GateClosed> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(GateClosed);
            }
            if inner.remaining > 0 {
                inner.remaining -= 1;
                Self::schedule_release(Arc::clone(&self.inner), self.window, self.limit, inner.epoch);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GateClosed),
        }
    }

    /// Cancel outstanding release timers and restore full capacity.
    ///
    /// Queued waiters are re-admitted immediately, up to the limit.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.remaining = self.limit;
        let epoch = inner.epoch;
        while inner.remaining > 0 {
            let Some(tx) = inner.queue.pop_front() else {
                break;
            };
            if tx.send(Ok(())).is_ok() {
                inner.remaining -= 1;
                Self::schedule_release(Arc::clone(&self.inner), self.window, self.limit, epoch);
            }
        }
    }

    /// Fail all pending waiters and reject future acquisitions.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.epoch += 1;
        while let Some(tx) = inner.queue.pop_front() {
            let _ = tx.send(Err(GateClosed));
        }
    }

    fn schedule_release(inner: Arc<Mutex<Inner>>, window: Duration, limit: u32, epoch: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut guard = inner.lock();
            if guard.closed || guard.epoch != epoch {
                return;
            }
            // Hand the slot straight to the next live waiter, or bank it.
            while let Some(tx) = guard.queue.pop_front() {
                if tx.send(Ok(())).is_ok() {
                    drop(guard);
                    Self::schedule_release(inner, window, limit, epoch);
                    return;
                }
                trace!("skipping cancelled waiter");
            }
            guard.remaining = (guard.remaining + 1).min(limit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_without_waiting() {
        let gate = TimesPerWindow::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            gate.acquire().await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(gate.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_acquisition_waits_for_a_release() {
        let gate = TimesPerWindow::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            gate.acquire().await.unwrap();
        }
        let start = Instant::now();
        gate.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_replenish_with_no_waiters() {
        let gate = TimesPerWindow::new(2, Duration::from_secs(1));
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(gate.remaining(), 2);
        let start = Instant::now();
        gate.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_fifo() {
        let gate = Arc::new(TimesPerWindow::new(1, Duration::from_secs(1)));
        gate.acquire().await.unwrap();

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                gate.acquire().await.unwrap();
                Instant::now()
            }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                gate.acquire().await.unwrap();
                Instant::now()
            }
        });

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(first <= second);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_capacity_immediately() {
        let gate = TimesPerWindow::new(2, Duration::from_secs(60));
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        gate.reset();
        let start = Instant::now();
        gate.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_waiters() {
        let gate = Arc::new(TimesPerWindow::new(1, Duration::from_secs(60)));
        gate.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.acquire().await }
        });
        tokio::task::yield_now().await;
        gate.close();

        assert_eq!(waiter.await.unwrap(), Err(GateClosed));
        assert_eq!(gate.acquire().await, Err(GateClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiters_are_skipped() {
        let gate = Arc::new(TimesPerWindow::new(1, Duration::from_secs(1)));
        gate.acquire().await.unwrap();

        let cancelled = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.acquire().await }
        });
        tokio::task::yield_now().await;
        cancelled.abort();

        let ok = timeout(Duration::from_secs(2), gate.acquire()).await;
        assert!(matches!(ok, Ok(Ok(()))));
    }
}
