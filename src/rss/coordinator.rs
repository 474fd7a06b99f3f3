//! orchestration of the full feed pipeline
use {
    crate::{
        engine::state::ShutdownFlag,
        error::Result,
        models::{ImageRef, SourceKind},
        rss::{
            cache::{DiskCache, MIN_CACHE_BEFORE_CLEANUP},
            downloader::Downloader,
            health::{FeedHealthStatus, FeedHealthTracker},
            parser::{self, FeedMode},
            ratelimit::RateLimiter,
        },
        settings::SourcesConfig,
    },
    chrono::Utc,
    hashbrown::{HashMap, HashSet},
    rand::seq::SliceRandom,
    std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    },
    tracing::{debug, info, warn},
};

/// ceiling for cached + freshly downloaded images per pass
pub const TARGET_TOTAL_IMAGES: usize = 50;

/// never download more than this many images from one feed per pass
pub const MAX_PER_FEED: usize = 3;

/// at least this many per feed while downloads are needed
pub const MIN_PER_FEED: usize = 1;

/// reddit feeds processed per pass regardless of priority
pub const MAX_REDDIT_FEEDS_PER_PASS: usize = 2;

/// feeds used when the host configures none
pub const DEFAULT_RSS_FEEDS: [&str; 6] = [
    "https://www.nasa.gov/feeds/iotd-feed",
    "https://commons.wikimedia.org/w/api.php?action=featuredfeed&feed=potd&feedformat=rss&language=en",
    "https://www.bing.com/HPImageArchive.aspx?format=rss&idx=0&n=8&mkt=en-US",
    "https://www.flickr.com/services/feeds/photos_public.gne?format=json&nojsoncallback=1",
    "https://www.flickr.com/services/feeds/photos_public.gne?tags=landscape,nature&format=json&nojsoncallback=1",
    "https://www.flickr.com/services/feeds/photos_public.gne?tags=space,astronomy,nebula&format=json&nojsoncallback=1",
];

/// domain priority: higher is processed earlier
fn source_priority(url: &str) -> u32 {
    let lowered = url.to_ascii_lowercase();
    for (domain, priority) in [
        ("bing.com", 95),
        ("flickr.com", 90),
        ("wikimedia.org", 85),
        ("nasa.gov", 75),
        ("reddit.com", 10),
    ] {
        if lowered.contains(domain) {
            return priority;
        }
    }
    50
}

fn is_reddit(url: &str) -> bool {
    url.to_ascii_lowercase().contains("reddit.com")
}

/// coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Loading,
    Loaded,
    Error,
}

/// orchestrates parser, downloader, disk cache, and health tracking
///
/// owned by the engine; worker tasks hold an `Arc` only for the duration of
/// a load. all pacing decisions (budget, priority order, reddit cap) are
/// made here so the leaf modules stay policy-free.
pub struct RssCoordinator {
    feed_urls: Vec<String>,
    state: Mutex<CoordinatorState>,
    cache: DiskCache,
    downloader: Downloader,
    health: FeedHealthTracker,
    save_to_disk: bool,
    save_directory: Option<PathBuf>,
    warmed: Mutex<bool>,
    shutdown: ShutdownFlag,
}

impl RssCoordinator {
    /// build the pipeline from settings
    ///
    /// # Errors
    ///
    /// returns an error if the cache directory or HTTP client cannot be set up
    pub fn new(
        sources: &SourcesConfig,
        http: &crate::settings::HttpConfig,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownFlag,
        health_file: Option<PathBuf>,
    ) -> Result<Self> {
        let feed_urls = if sources.rss_feeds.is_empty() {
            DEFAULT_RSS_FEEDS.iter().map(|s| s.to_string()).collect()
        } else {
            sources.rss_feeds.clone()
        };

        let cache = DiskCache::new(sources.rss_cache_directory.clone(), sources.rss_max_cache_mb)?;
        let downloader = Downloader::new(http, limiter, shutdown.clone())?;

        info!("rss coordinator initialised with {} feeds", feed_urls.len());
        Ok(Self {
            feed_urls,
            state: Mutex::new(CoordinatorState::Idle),
            cache,
            downloader,
            health: FeedHealthTracker::new(health_file),
            save_to_disk: sources.rss_save_to_disk,
            save_directory: sources.rss_save_directory.clone(),
            warmed: Mutex::new(false),
            shutdown,
        })
    }

    /// current lifecycle state
    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().expect("coordinator state lock poisoned")
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().expect("coordinator state lock poisoned") = state;
    }

    /// the configured feed urls
    pub fn feed_urls(&self) -> &[String] {
        &self.feed_urls
    }

    /// the disk cache directory
    pub fn cache_dir(&self) -> &std::path::Path {
        self.cache.cache_dir()
    }

    /// images currently known to the disk cache
    pub fn cached_images(&self) -> Vec<ImageRef> {
        self.cache.images().as_ref().clone()
    }

    /// number of images in the disk cache index
    pub fn cached_count(&self) -> usize {
        self.cache.count()
    }

    /// load cached images from disk; idempotent, safe from any task
    pub fn warm_cache(&self) -> usize {
        let mut warmed = self.warmed.lock().expect("warm flag lock poisoned");
        if *warmed {
            return self.cache.count();
        }
        let n = self.cache.load_from_disk().len();
        *warmed = true;
        n
    }

    /// remove every cached file; returns the number removed
    pub fn clear_cache(&self) -> usize {
        self.cache.clear_all()
    }

    /// run a full load pass on the current task
    ///
    /// returns only the newly downloaded images; cached ones are available
    /// through [`RssCoordinator::cached_images`].
    pub async fn load_feeds(&self) -> Vec<ImageRef> {
        self.set_state(CoordinatorState::Loading);

        let cached = self.cache.count();
        let new_needed = TARGET_TOTAL_IMAGES.saturating_sub(cached);
        if new_needed == 0 {
            info!("cache full ({} >= {}), skipping downloads", cached, TARGET_TOTAL_IMAGES);
            self.set_state(CoordinatorState::Loaded);
            return Vec::new();
        }
        if self.feed_urls.is_empty() {
            self.set_state(CoordinatorState::Loaded);
            return Vec::new();
        }

        let per_feed = per_feed_budget(new_needed, self.feed_urls.len());
        info!(
            "budget: cached={}, target={}, new_needed={}, per_feed={}, feeds={}",
            cached,
            TARGET_TOTAL_IMAGES,
            new_needed,
            per_feed,
            self.feed_urls.len()
        );

        let ordered = order_feeds(&self.feed_urls);
        let mut existing = self.cache.existing_paths();
        let mut all_new: Vec<ImageRef> = Vec::new();
        let mut budget_remaining = new_needed;

        for (i, feed_url) in ordered.iter().enumerate() {
            if self.shutdown.is_set() {
                info!("shutdown requested, aborting load");
                break;
            }
            if budget_remaining == 0 {
                info!("budget exhausted after {} feeds", i);
                break;
            }
            if self.health.should_skip(feed_url) {
                debug!("skipping unhealthy feed: {}", feed_url);
                continue;
            }

            let feed_limit = per_feed.min(budget_remaining);
            let new_images = self.process_single_feed(feed_url, feed_limit, &mut existing).await;

            if new_images.is_empty() {
                if is_reddit(feed_url) {
                    self.health.record_failure(feed_url);
                }
                continue;
            }

            budget_remaining = budget_remaining.saturating_sub(new_images.len());
            all_new.extend(new_images);
            self.health.record_success(feed_url);
        }

        if !all_new.is_empty() && self.cache.count() > MIN_CACHE_BEFORE_CLEANUP {
            self.cache.cleanup(MIN_CACHE_BEFORE_CLEANUP);
        }

        if all_new.is_empty() && cached == 0 && !self.feed_urls.is_empty() {
            self.set_state(CoordinatorState::Error);
        } else {
            self.set_state(CoordinatorState::Loaded);
        }
        info!("load complete: {} new images from {} feeds", all_new.len(), ordered.len());
        all_new
    }

    /// run a load on a background task, delivering the result exactly once
    ///
    /// the callback receives only the freshly downloaded batch (possibly
    /// empty); the receiver pre-loads cached images itself on first delivery.
    pub fn load_async<F>(self: &Arc<Self>, on_images: F)
    where
        F: FnOnce(Vec<ImageRef>) + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.warm_cache();
            let new_images = coordinator.load_feeds().await;
            on_images(new_images);
        });
    }

    /// refresh one feed, ignoring priority ordering
    pub async fn refresh_single_feed(&self, feed_url: &str) -> Vec<ImageRef> {
        let mut existing = self.cache.existing_paths();
        self.process_single_feed(feed_url, MAX_PER_FEED, &mut existing).await
    }

    /// make all pending and future downloads fail fast
    pub fn request_stop(&self) {
        self.shutdown.set();
    }

    /// per-feed health diagnostics
    pub fn health_report(&self) -> HashMap<String, FeedHealthStatus> {
        self.health.report(&self.feed_urls)
    }

    /// fetch, parse, and download up to `max_images` for one feed
    async fn process_single_feed(
        &self,
        feed_url: &str,
        max_images: usize,
        existing: &mut HashSet<PathBuf>,
    ) -> Vec<ImageRef> {
        if self.shutdown.is_set() {
            return Vec::new();
        }

        let (request_url, mode, original_url) = parser::resolve_feed_mode(feed_url);
        let entries = match mode {
            FeedMode::Json => match self.downloader.fetch_json(&request_url).await {
                Ok(data) => parser::parse_json(&data, &original_url, max_images),
                Err(e) => {
                    warn!("feed fetch failed: {} - {}", feed_url, e);
                    return Vec::new();
                }
            },
            FeedMode::Rss => match self.downloader.fetch_feed(&request_url).await {
                Ok(feed) => parser::parse_rss(&feed, feed_url, max_images),
                Err(e) => {
                    warn!("feed fetch failed: {} - {}", feed_url, e);
                    return Vec::new();
                }
            },
        };

        if entries.is_empty() {
            return Vec::new();
        }

        let mut new_images = Vec::new();
        for entry in entries {
            if self.shutdown.is_set() || new_images.len() >= max_images {
                break;
            }

            let expected_path = self.cache.cache_path_for(&entry.image_url);
            if existing.contains(&expected_path) || self.cache.is_cached(&entry.image_url) {
                continue;
            }

            let Some(cached_path) = self
                .downloader
                .download_image(&entry.image_url, self.cache.cache_dir())
                .await
            else {
                continue;
            };

            if self.save_to_disk
                && let Some(save_dir) = &self.save_directory
            {
                self.downloader.save_copy(&cached_path, save_dir).await;
            }

            let size_bytes = std::fs::metadata(&cached_path).map(|m| m.len()).ok();
            let format = cached_path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_uppercase());
            let image_id = entry
                .image_url
                .rsplit('/')
                .next()
                .unwrap_or(&entry.image_url)
                .to_string();

            let image = ImageRef {
                source_kind: SourceKind::Rss,
                source_id: feed_url.to_string(),
                image_id,
                local_path: Some(cached_path.clone()),
                url: Some(entry.image_url.clone()),
                title: Some(entry.title),
                description: Some(entry.description),
                author: Some(entry.author),
                created_at: entry.created_at,
                fetched_at: Some(Utc::now()),
                size_bytes,
                format,
            };

            self.cache.add(image.clone());
            self.cache.mark_cached(&entry.image_url);
            existing.insert(cached_path);
            new_images.push(image);
        }

        if !new_images.is_empty() {
            info!("+{} images from {}", new_images.len(), feed_url);
        }
        new_images
    }
}

/// images to request per feed this pass
pub fn per_feed_budget(new_needed: usize, num_feeds: usize) -> usize {
    (new_needed / num_feeds.max(1)).clamp(MIN_PER_FEED, MAX_PER_FEED)
}

/// order feeds by priority, shuffling ties, and cap reddit feeds
pub fn order_feeds(feed_urls: &[String]) -> Vec<String> {
    let mut shuffled: Vec<String> = feed_urls.to_vec();
    shuffled.shuffle(&mut rand::rng());
    // stable sort keeps the shuffled order within a priority tier
    shuffled.sort_by_key(|url| std::cmp::Reverse(source_priority(url)));

    let mut reddit_count = 0usize;
    let mut ordered = Vec::with_capacity(shuffled.len());
    for url in shuffled {
        if is_reddit(&url) {
            if reddit_count >= MAX_REDDIT_FEEDS_PER_PASS {
                debug!("skipping reddit feed over the per-pass cap: {}", url);
                continue;
            }
            reddit_count += 1;
        }
        ordered.push(url);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_feed_budget_clamps() {
        assert_eq!(per_feed_budget(50, 10), MAX_PER_FEED);
        assert_eq!(per_feed_budget(5, 10), MIN_PER_FEED);
        assert_eq!(per_feed_budget(20, 10), 2);
        assert_eq!(per_feed_budget(10, 0), MAX_PER_FEED);
    }

    #[test]
    fn test_source_priority_tiers() {
        assert!(source_priority("https://www.bing.com/x") > source_priority("https://flickr.com/x"));
        assert!(source_priority("https://flickr.com/x") > source_priority("https://commons.wikimedia.org/x"));
        assert!(source_priority("https://nasa.gov/x") > source_priority("https://reddit.com/x"));
        assert_eq!(source_priority("https://unknown.example/feed"), 50);
    }

    #[test]
    fn test_order_feeds_priority_and_reddit_cap() {
        let feeds: Vec<String> = vec![
            "https://www.reddit.com/r/a/.rss".into(),
            "https://www.reddit.com/r/b/.rss".into(),
            "https://www.reddit.com/r/c/.rss".into(),
            "https://www.nasa.gov/feeds/iotd-feed".into(),
            "https://www.bing.com/HPImageArchive.aspx".into(),
        ];
        let ordered = order_feeds(&feeds);

        assert_eq!(ordered.len(), 4, "third reddit feed dropped");
        assert!(ordered[0].contains("bing.com"));
        assert!(ordered[1].contains("nasa.gov"));
        assert!(ordered[2..].iter().all(|u| is_reddit(u)));
    }

    #[tokio::test]
    async fn test_new_uses_default_feeds_and_idle_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sources = SourcesConfig::default();
        sources.rss_cache_directory = Some(tmp.path().join("cache"));

        let coordinator = RssCoordinator::new(
            &sources,
            &crate::settings::HttpConfig::default(),
            Arc::new(RateLimiter::new()),
            ShutdownFlag::new(),
            Some(tmp.path().join("health.json")),
        )
        .unwrap();

        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert_eq!(coordinator.feed_urls().len(), DEFAULT_RSS_FEEDS.len());
        assert_eq!(coordinator.warm_cache(), 0);
        assert_eq!(coordinator.warm_cache(), 0);
    }

    #[tokio::test]
    async fn test_load_feeds_skips_when_cache_full() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sources = SourcesConfig::default();
        sources.rss_cache_directory = Some(tmp.path().join("cache"));
        sources.rss_feeds = vec!["https://feeds.example.invalid/rss".into()];

        let coordinator = RssCoordinator::new(
            &sources,
            &crate::settings::HttpConfig::default(),
            Arc::new(RateLimiter::new()),
            ShutdownFlag::new(),
            Some(tmp.path().join("health.json")),
        )
        .unwrap();

        // fill the in-memory index past the target so no downloads happen
        for i in 0..TARGET_TOTAL_IMAGES {
            let mut img = ImageRef::remote("feed", format!("{i}.jpg"), format!("https://x.test/{i}.jpg"));
            img.local_path = Some(tmp.path().join(format!("{i}.jpg")));
            coordinator.cache.add(img);
        }

        let new_images = coordinator.load_feeds().await;
        assert!(new_images.is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Loaded);
    }
}
