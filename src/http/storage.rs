//! Per-token rate limit state: route keys, discovered buckets, global lock.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::bucket::{AcquireOutcome, Bucket, RateLimitHeaders, RequestSession};
use super::global::GlobalRateLimiter;
use super::route::Route;
use crate::times_per::GateClosed;

/// How a response should feed back into the limiter state.
#[derive(Debug)]
pub(crate) enum ResponseDisposition<'a> {
    /// Rate limit headers were present.
    Headers(&'a RateLimitHeaders),
    /// A success response with no rate limit headers: the route is unlimited.
    NoRateLimitHeaders,
    /// Leave the bucket alone (shared-scope 429s, headerless errors).
    Untouched,
}

#[derive(Debug)]
enum RouteState {
    Pending(Arc<Bucket>),
    Known(Arc<Bucket>),
    Unlimited,
}

#[derive(Debug, Default)]
struct StorageInner {
    routes: HashMap<String, RouteState>,
    by_hash: HashMap<String, Arc<Bucket>>,
}

/// All rate-limit state for one `rate_limit_key` (commonly one token):
/// the route-key table, the discovered-bucket table, and the global limiter.
///
/// Owned by the engine; this is deliberately not a process singleton so
/// multiple tokens never share state.
#[derive(Debug)]
pub struct RateLimitStorage {
    inner: Mutex<StorageInner>,
    seq: AtomicU64,
    global: Box<dyn GlobalRateLimiter>,
}

impl RateLimitStorage {
    /// Create empty storage backed by the given global limiter.
    #[must_use]
    pub fn new(global: Box<dyn GlobalRateLimiter>) -> Self {
        Self {
            inner: Mutex::new(StorageInner::default()),
            seq: AtomicU64::new(0),
            global,
        }
    }

    /// The global rate limiter for this key.
    #[must_use]
    pub fn global(&self) -> &dyn GlobalRateLimiter {
        &*self.global
    }

    /// Wait for admission on the route's bucket.
    ///
    /// Lower `priority` values are admitted first; ties go FIFO.
    ///
    /// # Errors
    ///
    /// Returns [`GateClosed`] if the bucket is torn down while waiting.
    pub async fn acquire(&self, route: &Route, priority: i32) -> Result<RequestSession, GateClosed> {
        let bucket = {
            let mut inner = self.inner.lock();
            match inner.routes.entry(route.bucket_key()) {
                Entry::Occupied(entry) => match entry.get() {
                    RouteState::Unlimited => None,
                    RouteState::Pending(bucket) | RouteState::Known(bucket) => {
                        Some(Arc::clone(bucket))
                    }
                },
                Entry::Vacant(entry) => {
                    let bucket = Bucket::new_pending();
                    entry.insert(RouteState::Pending(Arc::clone(&bucket)));
                    Some(bucket)
                }
            }
        };
        let Some(bucket) = bucket else {
            return Ok(RequestSession::unlimited());
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let admission = match bucket.acquire(priority, seq) {
            AcquireOutcome::Ready(admission) => admission,
            AcquireOutcome::Pending(rx) => rx.await.map_err(|_| GateClosed)?,
        };
        Ok(RequestSession::admitted(admission))
    }

    /// Feed a response back into the limiter state and settle the session.
    ///
    /// This runs before the next waiter on the bucket can be admitted, so
    /// admission decisions never race the counters they depend on.
    pub(crate) fn settle(
        &self,
        route: &Route,
        session: &mut RequestSession,
        disposition: ResponseDisposition<'_>,
    ) {
        let was_probe = session.is_probe();
        let Some(bucket) = session.bucket().map(Arc::clone) else {
            session.mark_settled();
            return;
        };
        let was_reserved = session.is_reserved();
        match disposition {
            ResponseDisposition::Untouched => {
                session.mark_settled();
                if was_probe {
                    bucket.rearm_probe();
                } else if was_reserved {
                    bucket.release_reserved();
                }
            }
            ResponseDisposition::NoRateLimitHeaders => {
                session.mark_settled();
                let mut inner = self.inner.lock();
                if bucket.is_pending() {
                    debug!(key = %route.bucket_key(), "route has no rate limit");
                    bucket.make_unlimited();
                    inner.routes.insert(route.bucket_key(), RouteState::Unlimited);
                } else if was_reserved {
                    bucket.release_reserved();
                }
            }
            ResponseDisposition::Headers(headers) => {
                session.mark_settled();
                let mut inner = self.inner.lock();
                if bucket.is_pending() {
                    match inner.by_hash.get(&headers.bucket) {
                        Some(target) if !Arc::ptr_eq(target, &bucket) => {
                            let target = Arc::clone(target);
                            target.update_from_headers(headers);
                            bucket.redirect_into(&target);
                            inner.routes.insert(route.bucket_key(), RouteState::Known(target));
                            debug!(
                                key = %route.bucket_key(),
                                bucket = %headers.bucket,
                                "merged route into an already-discovered bucket"
                            );
                        }
                        _ => {
                            bucket.promote(headers);
                            inner.by_hash.insert(headers.bucket.clone(), Arc::clone(&bucket));
                            inner
                                .routes
                                .insert(route.bucket_key(), RouteState::Known(bucket));
                            debug!(
                                key = %route.bucket_key(),
                                bucket = %headers.bucket,
                                "discovered bucket identity"
                            );
                        }
                    }
                } else if was_reserved {
                    bucket.settle_with_headers(headers);
                } else {
                    bucket.update_from_headers(headers);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;
    use tokio::time::timeout;

    use super::super::global::UnlimitedGlobalRateLimiter;
    use super::*;

    fn storage() -> Arc<RateLimitStorage> {
        Arc::new(RateLimitStorage::new(Box::new(
            UnlimitedGlobalRateLimiter::new(),
        )))
    }

    fn messages_route(channel_id: u64) -> Route {
        Route::new(Method::GET, "/channels/{channel_id}/messages").channel_id(channel_id)
    }

    fn headers(bucket: &str, limit: u32, remaining: f64, reset_after: Duration) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: bucket.into(),
            limit,
            remaining,
            reset_after,
        }
    }

    async fn stalled<T>(future: impl std::future::Future<Output = T>) -> bool {
        timeout(Duration::from_millis(250), future).await.is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_route_admits_one_probe_at_a_time() {
        let storage = storage();
        let route = messages_route(1);

        let _probe = storage.acquire(&route, 0).await.unwrap();
        let second = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_releases_queued_sessions_up_to_remaining() {
        let storage = storage();
        let route = messages_route(1);

        let mut probe = storage.acquire(&route, 0).await.unwrap();
        let mut queued = Vec::new();
        for _ in 0..9 {
            queued.push(tokio::spawn({
                let storage = Arc::clone(&storage);
                let route = route.clone();
                async move { storage.acquire(&route, 0).await }
            }));
        }
        tokio::task::yield_now().await;

        storage.settle(
            &route,
            &mut probe,
            ResponseDisposition::Headers(&headers("abc", 5, 4.0, Duration::from_secs(60))),
        );

        // Four more fit in this window; the rest wait for the reset.
        let mut admitted = 0;
        let mut still_pending = 0;
        for task in queued {
            if stalled(task).await {
                still_pending += 1;
            } else {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
        assert_eq!(still_pending, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sessions_wake_when_the_window_resets() {
        let storage = storage();
        let route = messages_route(1);

        let mut probe = storage.acquire(&route, 0).await.unwrap();
        let waiting = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;

        storage.settle(
            &route,
            &mut probe,
            ResponseDisposition::Headers(&headers("abc", 5, 0.0, Duration::from_secs(2))),
        );

        let session = timeout(Duration::from_secs(3), waiting).await;
        assert!(session.is_ok_and(|joined| joined.is_ok_and(|acquired| acquired.is_ok())));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_value_is_admitted_first() {
        let storage = storage();
        let route = messages_route(1);

        let mut probe = storage.acquire(&route, 0).await.unwrap();
        storage.settle(
            &route,
            &mut probe,
            ResponseDisposition::Headers(&headers("abc", 1, 0.0, Duration::from_secs(5))),
        );

        let mut normals = Vec::new();
        for _ in 0..4 {
            normals.push(tokio::spawn({
                let storage = Arc::clone(&storage);
                let route = route.clone();
                async move { storage.acquire(&route, 0).await }
            }));
            tokio::task::yield_now().await;
        }
        let urgent = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route.clone();
            async move { storage.acquire(&route, -1).await }
        });
        tokio::task::yield_now().await;

        // The refill admits exactly one session: the urgent one, despite
        // being enqueued last.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(urgent.is_finished());
        for task in &normals {
            assert!(!task.is_finished());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_hash_routes_share_one_bucket() {
        let storage = storage();
        let route_a = messages_route(1);
        let route_b = messages_route(2);

        let mut probe_a = storage.acquire(&route_a, 0).await.unwrap();
        let mut probe_b = storage.acquire(&route_b, 0).await.unwrap();
        let queued_b = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route_b.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;

        let shared = headers("shared-hash", 3, 2.0, Duration::from_secs(60));
        storage.settle(&route_a, &mut probe_a, ResponseDisposition::Headers(&shared));
        storage.settle(&route_b, &mut probe_b, ResponseDisposition::Headers(&shared));

        // The queued session on B's placeholder is re-parented onto the
        // shared bucket and admitted from its remaining budget.
        assert!(!stalled(queued_b).await);

        // Tokens are shared: A admits once more, then both routes block.
        let _third = storage.acquire(&route_a, 0).await.unwrap();
        let blocked_a = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route_a.clone();
            async move { storage.acquire(&route, 0).await }
        });
        let blocked_b = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route_b.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;
        assert!(!blocked_a.is_finished());
        assert!(!blocked_b.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn routes_without_headers_become_unlimited() {
        let storage = storage();
        let route = messages_route(1);

        let mut probe = storage.acquire(&route, 0).await.unwrap();
        storage.settle(&route, &mut probe, ResponseDisposition::NoRateLimitHeaders);

        for _ in 0..20 {
            let session = storage.acquire(&route, 0).await.unwrap();
            drop(session);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_probe_rearms_the_placeholder() {
        let storage = storage();
        let route = messages_route(1);

        let probe = storage.acquire(&route, 0).await.unwrap();
        let waiting = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        // The probe dies without a response; the next waiter probes instead.
        drop(probe);
        let next = timeout(Duration::from_millis(250), waiting).await;
        assert!(next.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn user_scope_429_requeues_against_updated_counters() {
        let storage = storage();
        let route = messages_route(1);

        let mut probe = storage.acquire(&route, 0).await.unwrap();
        storage.settle(
            &route,
            &mut probe,
            ResponseDisposition::Headers(&headers("abc", 5, 0.0, Duration::from_secs(2))),
        );

        // The retry waits for the reset rather than re-entering immediately.
        let retry = tokio::spawn({
            let storage = Arc::clone(&storage);
            let route = route.clone();
            async move { storage.acquire(&route, 0).await }
        });
        tokio::task::yield_now().await;
        assert!(!retry.is_finished());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(retry.is_finished());
    }
}
