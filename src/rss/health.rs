//! per-feed failure tracking with exponential backoff and persistence
use {
    hashbrown::HashMap,
    serde::{Deserialize, Serialize},
    std::{
        path::PathBuf,
        sync::Mutex,
        time::{SystemTime, UNIX_EPOCH},
    },
    tracing::{debug, info},
};

/// consecutive failures before a feed is skipped
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// first backoff step; doubles per failure
const BACKOFF_BASE_SECONDS: f64 = 60.0;

/// entries older than this are forgotten entirely
const RESET_HOURS: f64 = 24.0;

/// persisted per-feed state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedHealth {
    /// consecutive failure count
    pub failures: u32,

    /// unix time of the most recent failure
    pub last_failure: f64,

    /// unix time until which the feed must not be contacted
    pub skip_until: f64,
}

/// diagnostic view of one feed, see [`FeedHealthTracker::report`]
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealthStatus {
    /// below the failure threshold
    pub healthy: bool,

    /// consecutive failure count
    pub failures: u32,

    /// unix time until which the feed is skipped
    pub skip_until: f64,

    /// whether the feed would be skipped right now
    pub skipped: bool,
}

/// tracks feed failures and decides when to stop contacting a feed
///
/// backoff is exponential: failure `k` pushes `skip_until` to
/// `now + 60 * 2^(k-1)` seconds. success clears the entry, and entries
/// whose last failure is older than 24 hours are forgotten. state persists
/// as json so restarts keep punishing broken feeds.
pub struct FeedHealthTracker {
    file: PathBuf,
    health: Mutex<HashMap<String, FeedHealth>>,
}

impl FeedHealthTracker {
    /// open the tracker backed by `file` (the default lives in the temp dir)
    pub fn new(file: Option<PathBuf>) -> Self {
        let file = file.unwrap_or_else(|| std::env::temp_dir().join("feed_health.json"));
        let health = Self::load(&file);
        if !health.is_empty() {
            debug!("loaded health for {} feeds", health.len());
        }
        Self {
            file,
            health: Mutex::new(health),
        }
    }

    /// whether this feed should be skipped due to backoff
    pub fn should_skip(&self, feed_url: &str) -> bool {
        self.should_skip_at(feed_url, unix_now())
    }

    fn should_skip_at(&self, feed_url: &str, now: f64) -> bool {
        let mut health = self.health.lock().expect("health lock poisoned");
        let Some(entry) = health.get(feed_url) else {
            return false;
        };

        if now - entry.last_failure > RESET_HOURS * 3600.0 {
            health.remove(feed_url);
            Self::save(&self.file, &health);
            return false;
        }

        entry.failures >= MAX_CONSECUTIVE_FAILURES && now < entry.skip_until
    }

    /// clear failure state for a feed
    pub fn record_success(&self, feed_url: &str) {
        let mut health = self.health.lock().expect("health lock poisoned");
        if health.remove(feed_url).is_some() {
            Self::save(&self.file, &health);
        }
    }

    /// count a failure and push the skip window out
    pub fn record_failure(&self, feed_url: &str) {
        self.record_failure_at(feed_url, unix_now());
    }

    fn record_failure_at(&self, feed_url: &str, now: f64) {
        let mut health = self.health.lock().expect("health lock poisoned");
        let entry = health.entry(feed_url.to_string()).or_default();
        entry.failures += 1;
        entry.last_failure = now;
        let backoff = BACKOFF_BASE_SECONDS * f64::powi(2.0, entry.failures as i32 - 1);
        entry.skip_until = now + backoff;
        info!("{}: failure #{}, backoff {}s", feed_url, entry.failures, backoff);
        Self::save(&self.file, &health);
    }

    /// health status for a list of feed urls
    pub fn report(&self, feed_urls: &[String]) -> HashMap<String, FeedHealthStatus> {
        let now = unix_now();
        let health = self.health.lock().expect("health lock poisoned");
        feed_urls
            .iter()
            .map(|url| {
                let status = match health.get(url) {
                    Some(h) => FeedHealthStatus {
                        healthy: h.failures < MAX_CONSECUTIVE_FAILURES,
                        failures: h.failures,
                        skip_until: h.skip_until,
                        skipped: now < h.skip_until,
                    },
                    None => FeedHealthStatus {
                        healthy: true,
                        failures: 0,
                        skip_until: 0.0,
                        skipped: false,
                    },
                };
                (url.clone(), status)
            })
            .collect()
    }

    /// snapshot of the tracked state (for tests and diagnostics)
    pub fn snapshot(&self, feed_url: &str) -> Option<FeedHealth> {
        self.health
            .lock()
            .expect("health lock poisoned")
            .get(feed_url)
            .cloned()
    }

    fn load(file: &PathBuf) -> HashMap<String, FeedHealth> {
        match std::fs::read_to_string(file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // corrupt file: treat as empty, it gets overwritten on the next save
                    debug!("health file unreadable, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    fn save(file: &PathBuf, health: &HashMap<String, FeedHealth>) {
        match serde_json::to_string(health) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(file, raw) {
                    debug!("health save failed: {}", e);
                }
            }
            Err(e) => debug!("health serialize failed: {}", e),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
