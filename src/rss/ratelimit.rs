//! per-domain sliding-window rate limiting shared by all feed tasks
use {
    hashbrown::HashMap,
    std::{
        collections::VecDeque,
        time::{Duration, Instant},
    },
    tokio::sync::Mutex,
    tracing::debug,
};

/// requests allowed per domain per window
const DOMAIN_RATE_LIMIT: usize = 15;

/// the sliding window length
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct DomainState {
    stamps: VecDeque<Instant>,
    paused_until: Option<Instant>,
}

/// a per-domain sliding-window limiter
///
/// at most 15 acquisitions complete per domain per 60 second window.
/// `acquire` suspends the calling task until the oldest in-window stamp ages
/// out; it never blocks a thread. other subsystems that hit the same hosts
/// can feed their requests into the window via [`RateLimiter::record_external`].
pub struct RateLimiter {
    domains: Mutex<HashMap<String, DomainState>>,
    limit: usize,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// make a limiter with the standard 15-per-60s policy
    pub fn new() -> Self {
        Self::with_limits(DOMAIN_RATE_LIMIT, RATE_WINDOW)
    }

    /// make a limiter with a custom policy
    pub fn with_limits(limit: usize, window: Duration) -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// wait until a request to `domain` is allowed, then claim a slot
    pub async fn acquire(&self, domain: &str) {
        loop {
            match self.try_acquire(domain).await {
                None => return,
                Some(delay) => {
                    debug!("rate limit: {} waiting {:?}", domain, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// claim a slot when one is free, otherwise return the needed delay
    ///
    /// callers that must stay interruptible (the downloader during
    /// shutdown) poll this instead of parking inside [`RateLimiter::acquire`].
    pub async fn try_acquire(&self, domain: &str) -> Option<Duration> {
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        let now = Instant::now();

        if let Some(until) = state.paused_until {
            if now < until {
                return Some(until - now);
            }
            state.paused_until = None;
        }
        Self::window_delay(state, now, self.limit, self.window)
    }

    /// claims a slot when free, otherwise returns the needed delay
    fn window_delay(
        state: &mut DomainState,
        now: Instant,
        limit: usize,
        window: Duration,
    ) -> Option<Duration> {
        while let Some(front) = state.stamps.front() {
            if now.duration_since(*front) >= window {
                state.stamps.pop_front();
            } else {
                break;
            }
        }

        if state.stamps.len() < limit {
            state.stamps.push_back(now);
            return None;
        }

        let oldest = *state.stamps.front().expect("stamps nonempty at limit");
        Some(window.saturating_sub(now.duration_since(oldest)))
    }

    /// record a request made by another subsystem against the window
    pub async fn record_external(&self, domain: &str) {
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        state.stamps.push_back(Instant::now());
    }

    /// pause a single domain, e.g. after an HTTP 429
    pub async fn pause_domain(&self, domain: &str, pause: Duration) {
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        state.paused_until = Some(Instant::now() + pause);
    }

    /// whether a domain is currently paused
    pub async fn is_paused(&self, domain: &str) -> bool {
        let domains = self.domains.lock().await;
        domains
            .get(domain)
            .and_then(|s| s.paused_until)
            .is_some_and(|until| Instant::now() < until)
    }
}

/// lowercase host of a url, or the raw string when it does not parse
pub fn host_of(raw_url: &str) -> String {
    url::Url::parse(raw_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_else(|| raw_url.to_ascii_lowercase())
}
