//! Process-wide HTTP admission.
//!
//! Discord enforces a global requests-per-second ceiling alongside the
//! per-route buckets. [`LimitedGlobalRateLimiter`] paces admission below a
//! static ceiling; [`UnlimitedGlobalRateLimiter`] admits immediately for
//! bots whose ceiling has been lifted, but both honor the freeze that a
//! global-scope 429 imposes.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::times_per::{GateClosed, TimesPerWindow};

/// Admission control for the global rate limit.
///
/// `acquire` is strictly FIFO; request priority only applies to buckets.
pub trait GlobalRateLimiter: fmt::Debug + Send + Sync {
    /// Wait for a global admission slot.
    fn acquire(&self) -> BoxFuture<'_, Result<(), GateClosed>>;

    /// Observe response headers. No current implementation uses them, but
    /// the engine feeds every response through here so an implementation
    /// driven by server state can exist without engine changes.
    fn update(&self, headers: &HeaderMap);

    /// A global-scope 429 arrived: block all new admissions for
    /// `retry_after`. In-flight holders are not interrupted.
    fn on_global_429(&self, retry_after: Duration);

    /// Fail pending waiters and reject future acquisitions.
    fn close(&self);
}

/// Freeze window shared by both limiter variants.
#[derive(Debug, Default)]
struct Freeze {
    until: Mutex<Option<Instant>>,
}

impl Freeze {
    fn engage(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut guard = self.until.lock();
        *guard = Some(guard.map_or(until, |existing| existing.max(until)));
    }

    async fn wait(&self) {
        loop {
            let deadline = {
                let mut guard = self.until.lock();
                match *guard {
                    None => return,
                    Some(until) if until <= Instant::now() => {
                        *guard = None;
                        return;
                    }
                    Some(until) => until,
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Global limiter enforcing a static requests-per-second ceiling.
#[derive(Debug)]
pub struct LimitedGlobalRateLimiter {
    gate: TimesPerWindow,
    freeze: Freeze,
}

impl LimitedGlobalRateLimiter {
    /// Create a limiter admitting `limit` requests per second.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            gate: TimesPerWindow::new(limit, Duration::from_secs(1)),
            freeze: Freeze::default(),
        }
    }
}

impl GlobalRateLimiter for LimitedGlobalRateLimiter {
    fn acquire(&self) -> BoxFuture<'_, Result<(), GateClosed>> {
        Box::pin(async move {
            self.freeze.wait().await;
            self.gate.acquire().await
        })
    }

    fn update(&self, _headers: &HeaderMap) {}

    fn on_global_429(&self, retry_after: Duration) {
        warn!(?retry_after, "hit the global rate limit despite pacing");
        self.freeze.engage(retry_after);
    }

    fn close(&self) {
        self.gate.close();
    }
}

/// Pass-through global limiter for bots with a negotiated unlimited ceiling.
///
/// Requests are admitted immediately until a global 429 arrives, which
/// freezes new admissions for its `retry_after`.
#[derive(Debug, Default)]
pub struct UnlimitedGlobalRateLimiter {
    freeze: Freeze,
    closed: Mutex<bool>,
}

impl UnlimitedGlobalRateLimiter {
    /// Create a pass-through limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalRateLimiter for UnlimitedGlobalRateLimiter {
    fn acquire(&self) -> BoxFuture<'_, Result<(), GateClosed>> {
        Box::pin(async move {
            if *self.closed.lock() {
                return Err(GateClosed);
            }
            self.freeze.wait().await;
            Ok(())
        })
    }

    fn update(&self, _headers: &HeaderMap) {}

    fn on_global_429(&self, retry_after: Duration) {
        debug!(?retry_after, "global 429 with no static limit configured");
        self.freeze.engage(retry_after);
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}
