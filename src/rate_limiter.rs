use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::TenantId;

/// Admission decision for one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,

    /// Quota left in the current window after this request.
    pub remaining: u32,
}

/// Accepted-request timestamps for one tenant.
#[derive(Debug, Default)]
struct SlidingWindow {
    accepted: VecDeque<Instant>,

    /// Window of the latest check; compaction evicts against it.
    window: Duration,
}

impl SlidingWindow {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Instant, limit: u32, window: Duration) -> RateDecision {
        self.window = window;
        self.evict(now, window);

        let count = self.accepted.len() as u32;
        if count >= limit {
            return RateDecision {
                allowed: false,
                remaining: 0,
            };
        }

        self.accepted.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit - (count + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub tracked_tenants: usize,
    pub tracked_requests: usize,
}

/// Per-tenant sliding-window admission control.
///
/// The tenant map is behind an `RwLock` and each window behind its own
/// `Mutex`, so checks for different tenants proceed in parallel while
/// checks for the same tenant are serialized. Compaction takes the map
/// write lock, which excludes every in-flight check.
pub struct RateLimiter {
    windows: RwLock<HashMap<TenantId, Arc<Mutex<SlidingWindow>>>>,
    overrides: RwLock<HashMap<TenantId, u32>>,
    default_limit: u32,
    max_limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(default_limit: u32, max_limit: u32, window: Duration) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            windows: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Override the limit for one tenant. Clamped to `[1, max_limit]`.
    pub async fn set_tenant_limit(&self, tenant_id: TenantId, limit: u32) {
        let limit = limit.clamp(1, self.max_limit);
        self.overrides.write().await.insert(tenant_id, limit);
    }

    /// Limit in force for `tenant_id`.
    pub async fn limit_for(&self, tenant_id: &TenantId) -> u32 {
        self.overrides
            .read()
            .await
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Admit or reject a request for `tenant_id` using its configured
    /// limit and the limiter's window.
    pub async fn check_tenant(&self, tenant_id: &TenantId) -> RateDecision {
        let limit = self.limit_for(tenant_id).await;
        self.check(tenant_id, limit, self.window).await
    }

    /// Admit or reject a request against an explicit limit and window.
    pub async fn check(&self, tenant_id: &TenantId, limit: u32, window: Duration) -> RateDecision {
        self.check_at(tenant_id, limit, window, Instant::now()).await
    }

    pub(crate) async fn check_at(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        {
            let guard = self.windows.read().await;
            if let Some(entry) = guard.get(tenant_id) {
                let mut entry = entry.lock().await;
                return entry.try_admit(now, limit, window);
            }
        }

        let mut guard = self.windows.write().await;
        let entry = guard
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::default())))
            .clone();
        let mut entry = entry.lock().await;
        entry.try_admit(now, limit, window)
    }

    /// Purge stale timestamps for every tenant and forget tenants with
    /// none left. Returns the number of tenants dropped.
    pub async fn compact(&self) -> usize {
        self.compact_at(Instant::now()).await
    }

    pub(crate) async fn compact_at(&self, now: Instant) -> usize {
        let mut guard = self.windows.write().await;
        let before = guard.len();
        let mut emptied = Vec::new();

        for (tenant_id, entry) in guard.iter() {
            let mut entry = entry.lock().await;
            let window = entry.window;
            entry.evict(now, window);
            if entry.accepted.is_empty() {
                emptied.push(tenant_id.clone());
            }
        }

        for tenant_id in emptied {
            guard.remove(&tenant_id);
        }

        let dropped = before - guard.len();
        if dropped > 0 {
            tracing::debug!(
                target: "rate_limiter",
                dropped,
                remaining = guard.len(),
                "compacted idle tenant windows"
            );
        }
        dropped
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let guard = self.windows.read().await;
        let mut tracked_requests = 0;
        for entry in guard.values() {
            tracked_requests += entry.lock().await.accepted.len();
        }
        RateLimiterStats {
            tracked_tenants: guard.len(),
            tracked_requests,
        }
    }

    /// Run [`RateLimiter::compact`] every `interval` until `stop` fires.
    pub fn spawn_compactor(self: Arc<Self>, interval: Duration, stop: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        self.compact().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3, 50, Duration::from_secs(1));
        let now = Instant::now();
        let t = tenant("t1");

        let remaining: Vec<u32> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let d = limiter.check_at(&t, 3, Duration::from_secs(1), now).await;
                assert!(d.allowed);
                out.push(d.remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);

        let rejected = limiter.check_at(&t, 3, Duration::from_secs(1), now).await;
        assert_eq!(rejected, RateDecision { allowed: false, remaining: 0 });
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_counted() {
        let limiter = RateLimiter::new(1, 50, Duration::from_secs(1));
        let start = Instant::now();
        let t = tenant("t1");
        let window = Duration::from_secs(1);

        assert!(limiter.check_at(&t, 1, window, start).await.allowed);
        for ms in [100, 300, 600, 900] {
            let at = start + Duration::from_millis(ms);
            assert!(!limiter.check_at(&t, 1, window, at).await.allowed);
        }

        // Only the first request occupies the window, so it frees up one
        // window after that request rather than after the last rejection.
        let later = start + Duration::from_millis(1000);
        assert!(limiter.check_at(&t, 1, window, later).await.allowed);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2, 50, Duration::from_secs(1));
        let start = Instant::now();
        let t = tenant("t1");
        let window = Duration::from_secs(1);

        assert!(limiter.check_at(&t, 2, window, start).await.allowed);
        let mid = start + Duration::from_millis(500);
        assert!(limiter.check_at(&t, 2, window, mid).await.allowed);
        assert!(!limiter
            .check_at(&t, 2, window, start + Duration::from_millis(900))
            .await
            .allowed);

        // First timestamp has aged out, second has not.
        let d = limiter
            .check_at(&t, 2, window, start + Duration::from_millis(1100))
            .await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let limiter = RateLimiter::new(1, 50, Duration::from_secs(1));
        let now = Instant::now();
        let window = Duration::from_secs(1);

        assert!(limiter.check_at(&tenant("a"), 1, window, now).await.allowed);
        assert!(!limiter.check_at(&tenant("a"), 1, window, now).await.allowed);
        assert!(limiter.check_at(&tenant("b"), 1, window, now).await.allowed);
    }

    #[tokio::test]
    async fn test_tenant_override_is_clamped() {
        let limiter = RateLimiter::new(10, 50, Duration::from_secs(1));
        limiter.set_tenant_limit(tenant("big"), 500).await;
        limiter.set_tenant_limit(tenant("zero"), 0).await;

        assert_eq!(limiter.limit_for(&tenant("big")).await, 50);
        assert_eq!(limiter.limit_for(&tenant("zero")).await, 1);
        assert_eq!(limiter.limit_for(&tenant("other")).await, 10);
    }

    #[tokio::test]
    async fn test_compaction_drops_idle_tenants() {
        let limiter = RateLimiter::new(5, 50, Duration::from_secs(1));
        let start = Instant::now();
        let window = Duration::from_secs(1);

        limiter.check_at(&tenant("idle"), 5, window, start).await;
        limiter
            .check_at(&tenant("busy"), 5, window, start + Duration::from_millis(1500))
            .await;

        let dropped = limiter.compact_at(start + Duration::from_millis(1600)).await;
        assert_eq!(dropped, 1);

        let stats = limiter.stats().await;
        assert_eq!(stats.tracked_tenants, 1);
        assert_eq!(stats.tracked_requests, 1);
    }

    #[tokio::test]
    async fn test_compaction_keeps_timestamps_of_longer_windows() {
        let limiter = RateLimiter::new(10, 50, Duration::from_secs(1));
        let start = Instant::now();
        let t = tenant("slow");
        let window = Duration::from_secs(60);

        assert!(limiter.check_at(&t, 1, window, start).await.allowed);
        assert!(!limiter
            .check_at(&t, 1, window, start + Duration::from_secs(1))
            .await
            .allowed);

        let dropped = limiter.compact_at(start + Duration::from_secs(2)).await;
        assert_eq!(dropped, 0);
        assert!(!limiter
            .check_at(&t, 1, window, start + Duration::from_secs(3))
            .await
            .allowed);
        assert!(limiter
            .check_at(&t, 1, window, start + Duration::from_secs(60))
            .await
            .allowed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(10, 50, Duration::from_secs(60)));
        let t = tenant("shared");

        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move { limiter.check_tenant(&t).await }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmits_after_window_of_silence() {
        let limiter = RateLimiter::new(1, 50, Duration::from_secs(1));
        let t = tenant("t1");

        assert!(limiter.check_tenant(&t).await.allowed);
        assert!(!limiter.check_tenant(&t).await.allowed);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check_tenant(&t).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compactor_task_runs_and_stops() {
        let limiter = Arc::new(RateLimiter::new(5, 50, Duration::from_secs(1)));
        limiter.check_tenant(&tenant("t1")).await;

        let stop = Arc::new(Notify::new());
        let handle = limiter
            .clone()
            .spawn_compactor(Duration::from_secs(60), stop.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.stats().await.tracked_tenants, 0);

        stop.notify_one();
        handle.await.unwrap();
    }
}
