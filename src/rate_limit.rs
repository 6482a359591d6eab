//! Fixed-window rate limiting keyed by route and caller
//!
//! Each (route, caller) pair owns a counter tagged with the index of the window it was last
//! touched in. The window index is `floor(now / window)`, so all callers share window
//! boundaries. A counter from an older window is reset before it is incremented. The
//! read-check-increment happens while holding the map shard's write lock, so concurrent requests
//! from the same caller can't both slip under the limit.
//!
//! Counters live in process memory: running several gateway instances multiplies the effective
//! budget by the number of instances.
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

pub const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Source of the current time, as a duration since the unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Duration;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Used to step through windows deterministically.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        let clock = Self::default();
        clock.set(start);
        clock
    }

    pub fn set(&self, at: Duration) {
        self.millis.store(at.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// The routes that carry their own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Ping,
    Chat,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Ping => "ping",
            Route::Chat => "chat",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn window_millis(&self) -> u128 {
        self.window.as_millis().max(1)
    }

    fn window_index(&self, now: Duration) -> u64 {
        (now.as_millis() / self.window_millis()) as u64
    }

    fn time_to_reset(&self, now: Duration) -> Duration {
        let window = self.window_millis();
        Duration::from_millis((window - now.as_millis() % window) as u64)
    }
}

/// The outcome of a single limiter check, including the quota metadata sent back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub window: Duration,
    pub reset_after: Duration,
}

impl RateLimitStatus {
    /// Seconds until the current window closes, rounded up.
    pub fn reset_secs(&self) -> u64 {
        let millis = self.reset_after.as_millis() as u64;
        millis.div_ceil(1000)
    }

    /// Writes the `RateLimit-*` headers (IETF draft 6 style).
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let policy = format!("{};w={}", self.limit, self.window.as_secs());
        if let Ok(policy) = HeaderValue::from_str(&policy) {
            headers.insert(RATELIMIT_POLICY, policy);
        }
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(self.reset_secs()));
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window: u64,
    count: u32,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    ping: RatePolicy,
    chat: RatePolicy,
    counters: DashMap<(Route, String), WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn with_clock(ping: RatePolicy, chat: RatePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            ping,
            chat,
            counters: DashMap::new(),
            clock,
        }
    }

    pub fn policy(&self, route: Route) -> RatePolicy {
        match route {
            Route::Ping => self.ping,
            Route::Chat => self.chat,
        }
    }

    /// Counts one request from `caller` against `route`'s budget.
    pub fn check(&self, route: Route, caller: &str) -> RateLimitStatus {
        let policy = self.policy(route);
        let now = self.clock.now();
        let window = policy.window_index(now);

        let count = {
            let mut counter = self
                .counters
                .entry((route, caller.to_owned()))
                .or_insert(WindowCounter { window, count: 0 });
            if counter.window != window {
                trace!(%route, caller, "Starting a new rate limit window");
                *counter = WindowCounter { window, count: 0 };
            }
            counter.count = counter.count.saturating_add(1);
            counter.count
        };

        let allowed = count <= policy.max_requests;
        if !allowed {
            debug!(%route, caller, count, limit = policy.max_requests, "Rate limit exceeded");
        }

        RateLimitStatus {
            allowed,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            window: policy.window,
            reset_after: policy.time_to_reset(now),
        }
    }

    /// Drops counters left over from previous windows. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let (ping, chat) = (self.ping.window_index(now), self.chat.window_index(now));
        let before = self.counters.len();
        self.counters.retain(|(route, _), counter| {
            counter.window
                == match route {
                    Route::Ping => ping,
                    Route::Chat => chat,
                }
        });
        before - self.counters.len()
    }

    /// Number of tracked (route, caller) counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
