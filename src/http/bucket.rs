//! Per-route token buckets with deferred server identity.
//!
//! A bucket starts out `Pending`: its server-side identity is unknown, so it
//! admits exactly one probe request at a time to avoid parallel probes each
//! minting a different identity in flight. The first response either promotes
//! it to `Known` (installing the limit, remaining count and reset clock from
//! the headers), redirects it into an already-discovered bucket sharing the
//! same `X-RateLimit-Bucket` hash, or marks the route `Unlimited`.
//!
//! `remaining` is authoritative from response headers, so admissions that
//! have not produced a response yet are tracked separately as `reserved`;
//! effective availability is `remaining - reserved`. Without that, the first
//! response of a burst would re-admit the whole queue against a stale count.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Parsed `X-RateLimit-*` response headers for one bucket.
#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    /// Server-side bucket id from `X-RateLimit-Bucket`.
    pub bucket: String,

    /// Maximum requests per window.
    pub limit: u32,

    /// Requests left in the current window. Fractional because Discord's
    /// reset clock is fractional.
    pub remaining: f64,

    /// Time until the window resets.
    pub reset_after: Duration,
}

impl RateLimitHeaders {
    /// Parse the rate-limit headers from a response.
    ///
    /// Returns `None` when `X-RateLimit-Bucket` is absent, which marks the
    /// route as unlimited. `Reset-After` is preferred; when only `Reset` is
    /// present the delta is computed against the server's `Date` header, not
    /// the local wall clock.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let bucket = header_str(headers, "X-RateLimit-Bucket")?.to_owned();
        let limit = header_str(headers, "X-RateLimit-Limit")?.parse().ok()?;
        let remaining: f64 = header_str(headers, "X-RateLimit-Remaining")?.parse().ok()?;
        let reset_after = if let Some(value) = header_str(headers, "X-RateLimit-Reset-After") {
            value.parse().ok().map(saturating_secs)?
        } else {
            let reset_at: f64 = header_str(headers, "X-RateLimit-Reset")?.parse().ok()?;
            let date = header_str(headers, "Date")?;
            let server_now = chrono::DateTime::parse_from_rfc2822(date).ok()?;
            #[allow(clippy::cast_precision_loss)]
            let server_secs = server_now.timestamp_millis() as f64 / 1000.0;
            saturating_secs(reset_at - server_secs)
        };
        Some(Self {
            bucket,
            limit,
            remaining,
            reset_after,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn saturating_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// An admitted request's hold on a bucket.
///
/// The engine passes this back to [`super::RateLimitStorage::settle`] with
/// the response outcome. Dropping an unsettled probe session re-arms the
/// identity probe so the next waiter can try; dropping an unsettled session
/// on a discovered bucket spends its token with no refund.
#[derive(Debug)]
pub struct RequestSession {
    bucket: Option<Arc<Bucket>>,
    probe: bool,
    reserved: bool,
    settled: bool,
}

impl RequestSession {
    pub(crate) fn unlimited() -> Self {
        Self {
            bucket: None,
            probe: false,
            reserved: false,
            settled: true,
        }
    }

    pub(crate) fn admitted(admission: Admitted) -> Self {
        Self {
            bucket: Some(admission.bucket),
            probe: admission.probe,
            reserved: admission.reserved,
            settled: false,
        }
    }

    pub(crate) fn bucket(&self) -> Option<&Arc<Bucket>> {
        self.bucket.as_ref()
    }

    pub(crate) const fn is_probe(&self) -> bool {
        self.probe
    }

    pub(crate) const fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
    }
}

impl Drop for RequestSession {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(bucket) = &self.bucket {
            if self.probe {
                trace!("probe died without a response, re-arming");
                bucket.rearm_probe();
            } else if self.reserved {
                bucket.release_spent();
            }
        }
    }
}

/// A granted admission, carrying the bucket that granted it. Merging can
/// re-parent queued sessions, so this may differ from the bucket the session
/// originally queued on.
#[derive(Debug)]
pub(crate) struct Admitted {
    pub bucket: Arc<Bucket>,
    pub probe: bool,
    pub reserved: bool,
}

pub(crate) enum AcquireOutcome {
    Ready(Admitted),
    Pending(oneshot::Receiver<Admitted>),
}

#[derive(Debug)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<Admitted>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; lower (priority, seq) must sort greater.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Debug)]
enum Identity {
    /// No response seen yet; serialize one probe at a time.
    Pending { probe_outstanding: bool },
    /// Aliased to a server-side bucket id.
    Known { hash: String },
    /// The server reported no rate limit for this route.
    Unlimited,
}

#[derive(Debug)]
struct BucketInner {
    identity: Identity,
    limit: f64,
    remaining: f64,
    reserved: u32,
    reset_at: Option<Instant>,
    queue: BinaryHeap<QueueEntry>,
    epoch: u64,
    timer_epoch: Option<u64>,
    redirect: Option<Arc<Bucket>>,
}

impl BucketInner {
    fn available(&self) -> f64 {
        self.remaining - f64::from(self.reserved)
    }

    fn refill_if_elapsed(&mut self) {
        if let Some(reset_at) = self.reset_at {
            if reset_at <= Instant::now() {
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }
    }
}

/// The live admission object for one rate-limit bucket.
#[derive(Debug)]
pub(crate) struct Bucket {
    inner: Mutex<BucketInner>,
}

impl Bucket {
    pub(crate) fn new_pending() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BucketInner {
                identity: Identity::Pending {
                    probe_outstanding: false,
                },
                limit: 1.0,
                remaining: 1.0,
                reserved: 0,
                reset_at: None,
                queue: BinaryHeap::new(),
                epoch: 0,
                timer_epoch: None,
                redirect: None,
            }),
        })
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.inner.lock().identity, Identity::Pending { .. })
    }

    /// Request admission. Ties between equal priorities go FIFO via the
    /// storage-wide `seq`.
    pub(crate) fn acquire(self: &Arc<Self>, priority: i32, seq: u64) -> AcquireOutcome {
        let mut bucket = Arc::clone(self);
        loop {
            let next = {
                let mut inner = bucket.inner.lock();
                if let Some(target) = inner.redirect.clone() {
                    target
                } else {
                    return Self::acquire_locked(&bucket, &mut inner, priority, seq);
                }
            };
            bucket = next;
        }
    }

    fn acquire_locked(
        bucket: &Arc<Self>,
        inner: &mut BucketInner,
        priority: i32,
        seq: u64,
    ) -> AcquireOutcome {
        if inner.queue.is_empty() {
            match &inner.identity {
                Identity::Unlimited => {
                    return AcquireOutcome::Ready(Admitted {
                        bucket: Arc::clone(bucket),
                        probe: false,
                        reserved: false,
                    });
                }
                Identity::Pending {
                    probe_outstanding: false,
                } => {
                    inner.identity = Identity::Pending {
                        probe_outstanding: true,
                    };
                    return AcquireOutcome::Ready(Admitted {
                        bucket: Arc::clone(bucket),
                        probe: true,
                        reserved: false,
                    });
                }
                Identity::Pending { .. } => {}
                Identity::Known { .. } => {
                    inner.refill_if_elapsed();
                    if inner.available() >= 1.0 {
                        inner.reserved += 1;
                        return AcquireOutcome::Ready(Admitted {
                            bucket: Arc::clone(bucket),
                            probe: false,
                            reserved: true,
                        });
                    }
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        inner.queue.push(QueueEntry { priority, seq, tx });
        Self::ensure_reset_timer(bucket, inner);
        AcquireOutcome::Pending(rx)
    }

    /// A reserved session's response arrived: release the reservation and
    /// apply the authoritative counters, then wake waiters.
    pub(crate) fn settle_with_headers(self: &Arc<Self>, headers: &RateLimitHeaders) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        apply_headers(&mut inner, headers);
        Self::ensure_reset_timer(self, &mut inner);
        Self::wake_locked(self, &mut inner);
    }

    /// Apply authoritative counters without touching reservations. Used when
    /// another route's response updates a shared bucket.
    pub(crate) fn update_from_headers(self: &Arc<Self>, headers: &RateLimitHeaders) {
        let mut inner = self.inner.lock();
        apply_headers(&mut inner, headers);
        Self::ensure_reset_timer(self, &mut inner);
        Self::wake_locked(self, &mut inner);
    }

    /// A reserved session finished without usable counters (shared-scope
    /// 429, headerless error): just release the reservation.
    pub(crate) fn release_reserved(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        Self::wake_locked(self, &mut inner);
    }

    /// A reserved session died without a response: its token counts as
    /// spent, with no refund.
    pub(crate) fn release_spent(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        inner.remaining = (inner.remaining - 1.0).max(0.0);
        Self::wake_locked(self, &mut inner);
    }

    /// First response for a pending route: install the discovered identity.
    pub(crate) fn promote(self: &Arc<Self>, headers: &RateLimitHeaders) {
        let mut inner = self.inner.lock();
        inner.identity = Identity::Known {
            hash: headers.bucket.clone(),
        };
        inner.reserved = 0;
        apply_headers(&mut inner, headers);
        Self::ensure_reset_timer(self, &mut inner);
        Self::wake_locked(self, &mut inner);
    }

    /// The server reported no rate limit: release everything queued.
    pub(crate) fn make_unlimited(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.identity = Identity::Unlimited;
        inner.epoch += 1;
        inner.timer_epoch = None;
        Self::wake_locked(self, &mut inner);
    }

    /// A probe died without revealing the identity; let the next waiter try.
    pub(crate) fn rearm_probe(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if matches!(inner.identity, Identity::Pending { .. }) {
            inner.identity = Identity::Pending {
                probe_outstanding: false,
            };
            Self::wake_locked(self, &mut inner);
        }
    }

    /// Re-parent every queued session onto `target` and forward all future
    /// acquisitions there. Called when this route's first response reveals a
    /// bucket id another route already discovered.
    pub(crate) fn redirect_into(self: &Arc<Self>, target: &Arc<Self>) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.redirect = Some(Arc::clone(target));
            inner.epoch += 1;
            inner.timer_epoch = None;
            let mut entries = Vec::with_capacity(inner.queue.len());
            while let Some(entry) = inner.queue.pop() {
                entries.push(entry);
            }
            entries
        };
        let mut inner = target.inner.lock();
        for entry in drained {
            inner.queue.push(entry);
        }
        Self::wake_locked(target, &mut inner);
    }

    fn wake_locked(bucket: &Arc<Self>, inner: &mut BucketInner) {
        loop {
            if matches!(inner.identity, Identity::Unlimited) {
                while let Some(entry) = inner.queue.pop() {
                    let _ = entry.tx.send(Admitted {
                        bucket: Arc::clone(bucket),
                        probe: false,
                        reserved: false,
                    });
                }
                return;
            }
            if matches!(
                inner.identity,
                Identity::Pending {
                    probe_outstanding: true
                }
            ) {
                return;
            }
            if matches!(inner.identity, Identity::Pending { .. }) {
                let Some(entry) = pop_live(&mut inner.queue) else {
                    return;
                };
                if entry
                    .tx
                    .send(Admitted {
                        bucket: Arc::clone(bucket),
                        probe: true,
                        reserved: false,
                    })
                    .is_ok()
                {
                    inner.identity = Identity::Pending {
                        probe_outstanding: true,
                    };
                    return;
                }
                continue;
            }
            // Known
            inner.refill_if_elapsed();
            if inner.available() < 1.0 {
                Self::ensure_reset_timer(bucket, inner);
                return;
            }
            let Some(entry) = pop_live(&mut inner.queue) else {
                return;
            };
            if entry
                .tx
                .send(Admitted {
                    bucket: Arc::clone(bucket),
                    probe: false,
                    reserved: true,
                })
                .is_ok()
            {
                inner.reserved += 1;
            }
        }
    }

    fn ensure_reset_timer(bucket: &Arc<Self>, inner: &mut BucketInner) {
        let Some(reset_at) = inner.reset_at else {
            return;
        };
        if inner.timer_epoch == Some(inner.epoch) {
            return;
        }
        inner.timer_epoch = Some(inner.epoch);
        let epoch = inner.epoch;
        let bucket = Arc::clone(bucket);
        tokio::spawn(async move {
            tokio::time::sleep_until(reset_at).await;
            let mut inner = bucket.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.timer_epoch = None;
            inner.refill_if_elapsed();
            Self::wake_locked(&bucket, &mut inner);
        });
    }
}

fn apply_headers(inner: &mut BucketInner, headers: &RateLimitHeaders) {
    inner.limit = f64::from(headers.limit);
    inner.remaining = headers.remaining;
    inner.reset_at = Some(Instant::now() + headers.reset_after);
    inner.epoch += 1;
    inner.timer_epoch = None;
    debug!(
        bucket = %headers.bucket,
        remaining = headers.remaining,
        reset_after = ?headers.reset_after,
        "updated bucket counters"
    );
}

fn pop_live(queue: &mut BinaryHeap<QueueEntry>) -> Option<QueueEntry> {
    while let Some(entry) = queue.pop() {
        if entry.tx.is_closed() {
            trace!("dropping cancelled session from queue");
            continue;
        }
        return Some(entry);
    }
    None
}
