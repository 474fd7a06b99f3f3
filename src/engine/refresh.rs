//! background feed refresh: dynamic caps, merge, and stale eviction
use {
    crate::{
        events::{EventBus, EventKind},
        models::{ImageRef, SourceKind},
        queue::ImageQueue,
        settings::Settings,
    },
    chrono::{Duration as ChronoDuration, Utc},
    hashbrown::HashSet,
    rand::{RngExt, seq::SliceRandom},
    serde_json::json,
    std::time::Duration,
    tracing::{debug, info},
};

/// cap and stale TTL derived from the rotation interval
///
/// slow rotations need fewer queued feed images and keep them longer, so
/// downloads are not wasted on images that will never be shown.
pub fn dynamic_rss_settings(interval_secs: u64) -> (usize, i64) {
    if interval_secs <= 30 {
        (20, 30)
    } else if interval_secs <= 90 {
        (15, 45)
    } else {
        (10, 60)
    }
}

/// ceiling on feed images kept in the queue
pub fn rss_background_cap(settings: &Settings) -> usize {
    let (dynamic_cap, _) = dynamic_rss_settings(settings.timing.interval);
    match settings.sources.rss_background_cap {
        Some(cap) => cap as usize,
        None => dynamic_cap,
    }
}

/// TTL in minutes before an unshown feed image may be evicted; <= 0 disables
pub fn rss_stale_minutes(settings: &Settings) -> i64 {
    let (_, dynamic_decay) = dynamic_rss_settings(settings.timing.interval);
    settings.sources.rss_stale_minutes.unwrap_or(dynamic_decay)
}

/// background refresh period with +/- one minute of jitter
///
/// the jitter keeps the refresh from aligning with other recurring timers.
pub fn refresh_period(settings: &Settings) -> Duration {
    let base_min = settings.sources.rss_refresh_minutes as i64;
    let jitter: i64 = rand::rng().random_range(-1..=1);
    let minutes = (base_min + jitter).max(1);
    Duration::from_secs(minutes as u64 * 60)
}

/// what a merge did, also the payload of the `rss.updated` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub removed_stale: usize,
    pub total_rss: usize,
}

/// merge a batch of feed images into the queue under the global cap
///
/// duplicates (by path or url) are dropped, as are items whose source is
/// not in `allowed_sources`; that is how results from loads that were in
/// flight across a reconfiguration get filtered. when `evict_stale` is set
/// and the merge added anything, up to `added` stale feed images outside
/// the recent history are removed so the pool does not grow stale.
/// publishes `rss.updated` when anything changed.
pub fn merge_rss_batch(
    queue: &ImageQueue,
    events: &EventBus,
    settings: &Settings,
    batch: Vec<ImageRef>,
    allowed_sources: Option<&HashSet<String>>,
    evict_stale: bool,
) -> MergeStats {
    let cap = rss_background_cap(settings);
    if cap == 0 || batch.is_empty() {
        return MergeStats::default();
    }

    let snapshot = queue.all_images();
    let existing_keys: HashSet<String> = snapshot.iter().map(ImageRef::key).collect();
    let current_rss = snapshot
        .iter()
        .filter(|img| img.source_kind == SourceKind::Rss)
        .count();

    let remaining = cap.saturating_sub(current_rss);
    if remaining == 0 {
        debug!("rss cap reached ({}), skipping {} images", cap, batch.len());
        return MergeStats::default();
    }

    let mut new_items: Vec<ImageRef> = batch
        .into_iter()
        .filter(|img| img.source_kind == SourceKind::Rss)
        .filter(|img| !img.key().is_empty() && !existing_keys.contains(&img.key()))
        .filter(|img| allowed_sources.is_none_or(|set| set.contains(&img.source_id)))
        .collect();

    if new_items.is_empty() {
        return MergeStats::default();
    }

    if evict_stale {
        new_items.shuffle(&mut rand::rng());
    }
    new_items.truncate(remaining);
    let added = queue.add(new_items);

    let mut removed_stale = 0usize;
    if evict_stale && added > 0 {
        removed_stale = evict_stale_images(queue, settings, added);
    }

    let total_rss = queue.rss_count();
    if added > 0 || removed_stale > 0 {
        info!(
            "rss merge: added={}, removed_stale={}, total_rss={}",
            added, removed_stale, total_rss
        );
        events.publish(
            EventKind::RssUpdated.as_str(),
            json!({
                "added": added,
                "removed_stale": removed_stale,
                "total_rss": total_rss,
            }),
        );
    }

    MergeStats {
        added,
        removed_stale,
        total_rss,
    }
}

/// remove up to `added` feed images older than the stale TTL
///
/// images in the recent history are protected, so something currently (or
/// nearly) on screen never disappears from under the rotation.
fn evict_stale_images(queue: &ImageQueue, settings: &Settings, added: usize) -> usize {
    let stale_minutes = rss_stale_minutes(settings);
    if stale_minutes <= 0 {
        return 0;
    }

    let cutoff = Utc::now() - ChronoDuration::minutes(stale_minutes);
    let history: HashSet<String> = queue.history_paths().into_iter().collect();

    let stale_paths: Vec<std::path::PathBuf> = queue
        .all_images()
        .into_iter()
        .filter(|img| img.source_kind == SourceKind::Rss)
        .filter_map(|img| {
            let path = img.local_path.clone()?;
            if history.contains(&path.to_string_lossy().into_owned()) {
                return None;
            }
            let stamp = img.fetched_at.or(img.created_at)?;
            (stamp < cutoff).then_some(path)
        })
        .collect();

    let mut removed = 0usize;
    for path in stale_paths.into_iter().take(added) {
        if queue.remove(&path) {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::path::PathBuf,
        std::sync::Arc,
    };

    fn remote_img(n: usize, fetched_minutes_ago: i64) -> ImageRef {
        let mut img = ImageRef::remote(
            "https://feed.example/rss",
            format!("r{n}.jpg"),
            format!("https://img.example/r{n}.jpg"),
        );
        img.local_path = Some(PathBuf::from(format!("/cache/r{n}.jpg")));
        img.fetched_at = Some(Utc::now() - ChronoDuration::minutes(fetched_minutes_ago));
        img
    }

    fn allowed() -> HashSet<String> {
        let mut set = HashSet::new();
        set.insert("https://feed.example/rss".to_string());
        set.insert("cached".to_string());
        set
    }

    fn settings_with_interval(interval: u64) -> Settings {
        let mut s = Settings::default();
        s.timing.interval = interval;
        s
    }

    #[test]
    fn test_dynamic_settings_tiers() {
        assert_eq!(dynamic_rss_settings(30), (20, 30));
        assert_eq!(dynamic_rss_settings(60), (15, 45));
        assert_eq!(dynamic_rss_settings(300), (10, 60));
    }

    #[test]
    fn test_cap_and_stale_overrides() {
        let mut s = settings_with_interval(60);
        assert_eq!(rss_background_cap(&s), 15);
        assert_eq!(rss_stale_minutes(&s), 45);

        s.sources.rss_background_cap = Some(40);
        s.sources.rss_stale_minutes = Some(-1);
        assert_eq!(rss_background_cap(&s), 40);
        assert_eq!(rss_stale_minutes(&s), -1);
    }

    #[test]
    fn test_merge_dedupes_by_key() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = EventBus::new();
        let settings = settings_with_interval(60);

        let first = merge_rss_batch(&queue, &events, &settings, vec![remote_img(1, 0)], Some(&allowed()), true);
        assert_eq!(first.added, 1);

        // the same image again adds nothing and publishes nothing
        let second = merge_rss_batch(&queue, &events, &settings, vec![remote_img(1, 0)], Some(&allowed()), true);
        assert_eq!(second, MergeStats::default());
        assert_eq!(events.history(10).len(), 1);
    }

    #[test]
    fn test_merge_respects_cap() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = EventBus::new();
        let mut settings = settings_with_interval(60);
        settings.sources.rss_background_cap = Some(5);

        let batch: Vec<ImageRef> = (0..10).map(|n| remote_img(n, 0)).collect();
        let stats = merge_rss_batch(&queue, &events, &settings, batch, Some(&allowed()), false);
        assert_eq!(stats.added, 5);
        assert_eq!(stats.total_rss, 5);
    }

    #[test]
    fn test_merge_drops_unconfigured_sources() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = EventBus::new();
        let settings = settings_with_interval(60);

        let mut stale_source = remote_img(1, 0);
        stale_source.source_id = "https://removed.example/rss".to_string();
        let stats = merge_rss_batch(&queue, &events, &settings, vec![stale_source], Some(&allowed()), true);
        assert_eq!(stats.added, 0);
    }

    #[test]
    fn test_stale_eviction_bounded_by_added() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = EventBus::new();
        let mut settings = settings_with_interval(60);
        settings.sources.rss_background_cap = Some(100);
        settings.sources.rss_stale_minutes = Some(45);

        // 25 feed images: 10 stale (old fetch stamps), 15 fresh
        let mut seed: Vec<ImageRef> = (0..10).map(|n| remote_img(n, 120)).collect();
        seed.extend((10..25).map(|n| remote_img(n, 1)));
        queue.add(seed);

        let batch: Vec<ImageRef> = (100..104).map(|n| remote_img(n, 0)).collect();
        let stats = merge_rss_batch(&queue, &events, &settings, batch, Some(&allowed()), true);

        assert_eq!(stats.added, 4);
        assert_eq!(stats.removed_stale, 4, "eviction is bounded by the add count");
        assert_eq!(stats.total_rss, 25, "pool size is preserved");
    }

    #[test]
    fn test_stale_eviction_disabled_by_override() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = EventBus::new();
        let mut settings = settings_with_interval(60);
        settings.sources.rss_background_cap = Some(100);
        settings.sources.rss_stale_minutes = Some(0);

        queue.add((0..5).map(|n| remote_img(n, 300)).collect());
        let stats = merge_rss_batch(&queue, &events, &settings, vec![remote_img(50, 0)], Some(&allowed()), true);
        assert_eq!(stats.removed_stale, 0);
    }

    #[test]
    fn test_history_protects_from_eviction() {
        let queue = ImageQueue::new(false, 50, 60);
        let events = Arc::new(EventBus::new());
        let mut settings = settings_with_interval(60);
        settings.sources.rss_background_cap = Some(100);
        settings.sources.rss_stale_minutes = Some(45);

        queue.add(vec![remote_img(0, 120)]);
        let served = queue.next().unwrap();

        let stats = merge_rss_batch(&queue, &events, &settings, vec![remote_img(1, 0)], Some(&allowed()), true);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed_stale, 0, "history-protected image survives");
        assert!(
            queue
                .all_images()
                .iter()
                .any(|img| img.key() == served.key())
        );
    }

    #[test]
    fn test_refresh_period_bounds() {
        let mut settings = settings_with_interval(60);
        settings.sources.rss_refresh_minutes = 10;
        for _ in 0..20 {
            let period = refresh_period(&settings);
            assert!(period >= Duration::from_secs(9 * 60));
            assert!(period <= Duration::from_secs(11 * 60));
        }

        settings.sources.rss_refresh_minutes = 1;
        for _ in 0..20 {
            assert!(refresh_period(&settings) >= Duration::from_secs(60));
        }
    }
}
