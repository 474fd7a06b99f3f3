//! rotation queue with dual pools, recency history, and domain diversity
use {
    crate::models::{ImageRef, SourceKind},
    rand::{RngExt, seq::SliceRandom},
    std::{
        collections::VecDeque,
        path::Path,
        sync::Mutex,
    },
    tracing::{debug, info, warn},
};

/// folder images may repeat after this many transitions
const LOCAL_LOOKBACK: usize = 5;

/// feed images need this many transitions before a repeat
const RSS_LOOKBACK: usize = 15;

/// candidates examined per pool while hunting for a non-repeat
const SCAN_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Local,
    Rss,
}

#[derive(Default)]
struct QueueInner {
    shuffle_enabled: bool,
    history_size: usize,
    local_ratio: u8,
    local_images: Vec<ImageRef>,
    rss_images: Vec<ImageRef>,
    local_queue: VecDeque<ImageRef>,
    rss_queue: VecDeque<ImageRef>,
    history: VecDeque<ImageRef>,
    current: Option<ImageRef>,
    wrap_count: u64,
    local_served: u64,
    rss_served: u64,
    last_rss_domain: String,
}

/// a point-in-time view of the queue, see [`ImageQueue::stats`]
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub total_images: usize,
    pub local_pool_total: usize,
    pub rss_pool_total: usize,
    pub local_pool_remaining: usize,
    pub rss_pool_remaining: usize,
    pub history_len: usize,
    pub wrap_count: u64,
    pub shuffle_enabled: bool,
    pub local_ratio_setting: u8,
    pub local_shown: u64,
    pub rss_shown: u64,
    pub actual_local_pct: f64,
    pub actual_rss_pct: f64,
    pub current: Option<String>,
}

/// the rotation queue feeding the display
///
/// images live in two pools, local folders and feeds, drained through
/// per-pool queues that rebuild (shuffled, when enabled) on wraparound.
/// selection is ratio-biased between the pools, avoids anything served in
/// the recent history window (5 transitions for folder images, 15 for feed
/// images), and prefers a different feed domain than the previous feed
/// image. all state sits behind one lock; the engine task is the only
/// writer, other threads only take snapshots.
pub struct ImageQueue {
    inner: Mutex<QueueInner>,
}

impl ImageQueue {
    /// make an empty queue
    pub fn new(shuffle: bool, history_size: usize, local_ratio: u8) -> Self {
        info!(
            "image queue initialised (shuffle={}, history_size={}, local_ratio={}%)",
            shuffle, history_size, local_ratio
        );
        Self {
            inner: Mutex::new(QueueInner {
                shuffle_enabled: shuffle,
                history_size,
                local_ratio: local_ratio.min(100),
                ..QueueInner::default()
            }),
        }
    }

    /// add a batch of images, categorising them into pools
    ///
    /// # Returns
    ///
    /// how many images were added
    pub fn add(&self, images: Vec<ImageRef>) -> usize {
        if images.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        let count = images.len();

        let (local_new, rss_new): (Vec<ImageRef>, Vec<ImageRef>) = images
            .into_iter()
            .partition(|img| img.source_kind == SourceKind::Folder);

        inner.local_images.extend(local_new.iter().cloned());
        inner.rss_images.extend(rss_new.iter().cloned());

        let shuffle = inner.shuffle_enabled;
        Self::extend_queue(&mut inner.local_queue, local_new, shuffle);
        Self::extend_queue(&mut inner.rss_queue, rss_new, shuffle);

        debug!(
            "added {} images (pools: local={}, rss={})",
            count,
            inner.local_images.len(),
            inner.rss_images.len()
        );
        count
    }

    /// replace every image in the queue
    pub fn replace(&self, images: Vec<ImageRef>) -> usize {
        self.clear();
        self.add(images)
    }

    /// serve the next image
    ///
    /// returns `None` only when both pools are empty.
    pub fn next(&self) -> Option<ImageRef> {
        let mut inner = self.lock();

        let order = if Self::should_use_local(&inner) {
            [Pool::Local, Pool::Rss]
        } else {
            [Pool::Rss, Pool::Local]
        };

        let mut chosen: Option<ImageRef> = None;
        let mut skipped: Vec<(Pool, ImageRef)> = Vec::new();
        let mut same_domain_fallback: Option<ImageRef> = None;

        'pools: for pool in order {
            let membership = match pool {
                Pool::Local => inner.local_images.len(),
                Pool::Rss => inner.rss_images.len(),
            };
            // a full cycle through a small pool is enough; popping further
            // would only re-skip the same entries
            let scan = SCAN_LIMIT.min(membership);

            for _ in 0..scan {
                let Some(candidate) = Self::pop_from(&mut inner, pool) else {
                    break;
                };

                if Self::in_recent_history(&inner, &candidate) {
                    skipped.push((pool, candidate));
                    continue;
                }

                if pool == Pool::Rss && !inner.last_rss_domain.is_empty() {
                    if candidate.domain() != inner.last_rss_domain {
                        chosen = Some(candidate);
                        break 'pools;
                    }
                    if same_domain_fallback.is_none() {
                        same_domain_fallback = Some(candidate.clone());
                    }
                    skipped.push((pool, candidate));
                    continue;
                }

                chosen = Some(candidate);
                break 'pools;
            }
        }

        // no fresh candidate with a new domain: take a fresh same-domain one
        if chosen.is_none()
            && let Some(fallback) = same_domain_fallback
        {
            chosen = Some(fallback);
        }

        // graceful degradation: everything was recent, re-serve the first skip
        if chosen.is_none()
            && let Some((_, first)) = skipped.first()
        {
            warn!("no non-recent image available, re-serving {}", first.key());
            chosen = Some(first.clone());
        }

        // unused candidates go back to the front in their original order
        let chosen_key = chosen.as_ref().map(ImageRef::key);
        for (pool, candidate) in skipped.into_iter().rev() {
            if Some(candidate.key()) == chosen_key {
                continue;
            }
            match pool {
                Pool::Local => inner.local_queue.push_front(candidate),
                Pool::Rss => inner.rss_queue.push_front(candidate),
            }
        }

        let image = chosen?;
        inner.current = Some(image.clone());
        if inner.history.len() == inner.history_size.max(1) {
            inner.history.pop_front();
        }
        inner.history.push_back(image.clone());

        match image.source_kind {
            SourceKind::Folder => inner.local_served += 1,
            SourceKind::Rss => {
                inner.rss_served += 1;
                inner.last_rss_domain = image.domain();
            }
        }

        debug!(
            "next image: {} (kind={:?}, local_pool={}, rss_pool={})",
            image.key(),
            image.source_kind,
            inner.local_images.len(),
            inner.rss_images.len()
        );
        Some(image)
    }

    /// go back to the previous image in history without advancing
    pub fn previous(&self) -> Option<ImageRef> {
        let mut inner = self.lock();
        if inner.history.len() < 2 {
            warn!("no previous image in history");
            return inner.current.clone();
        }
        inner.history.pop_back();
        let prev = inner.history.back().cloned();
        inner.current = prev.clone();
        prev
    }

    /// the current image, without advancing
    pub fn current(&self) -> Option<ImageRef> {
        self.lock().current.clone()
    }

    /// look at up to `count` upcoming images without consuming them
    ///
    /// pools are interleaved so prefetch hints cover both.
    pub fn peek_many(&self, count: usize) -> Vec<ImageRef> {
        if count == 0 {
            return Vec::new();
        }
        let inner = self.lock();
        let mut local = inner.local_queue.iter();
        let mut rss = inner.rss_queue.iter();
        let mut upcoming = Vec::with_capacity(count);

        while upcoming.len() < count {
            match (local.next(), rss.next()) {
                (None, None) => break,
                (a, b) => {
                    for img in [a, b].into_iter().flatten() {
                        if upcoming.len() < count {
                            upcoming.push(img.clone());
                        }
                    }
                }
            }
        }
        upcoming
    }

    /// remove an image by local path from the pools and queues
    pub fn remove(&self, local_path: &Path) -> bool {
        let mut inner = self.lock();
        let matches = |img: &ImageRef| img.local_path.as_deref() == Some(local_path);

        let before =
            inner.local_images.len() + inner.rss_images.len() + inner.local_queue.len() + inner.rss_queue.len();
        inner.local_images.retain(|img| !matches(img));
        inner.rss_images.retain(|img| !matches(img));
        inner.local_queue.retain(|img| !matches(img));
        inner.rss_queue.retain(|img| !matches(img));
        let removed = before
            != inner.local_images.len()
                + inner.rss_images.len()
                + inner.local_queue.len()
                + inner.rss_queue.len();

        if removed {
            info!("removed image from queue: {:?}", local_path);
        }
        removed
    }

    /// drop everything and reset counters
    pub fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.local_images.len() + inner.rss_images.len();
        let (shuffle, history_size, ratio) =
            (inner.shuffle_enabled, inner.history_size, inner.local_ratio);
        *inner = QueueInner {
            shuffle_enabled: shuffle,
            history_size,
            local_ratio: ratio,
            ..QueueInner::default()
        };
        info!("queue cleared ({} images removed)", count);
    }

    /// snapshot of every image known to the queue
    pub fn all_images(&self) -> Vec<ImageRef> {
        let inner = self.lock();
        inner
            .local_images
            .iter()
            .chain(inner.rss_images.iter())
            .cloned()
            .collect()
    }

    /// number of feed images in the pools
    pub fn rss_count(&self) -> usize {
        self.lock().rss_images.len()
    }

    /// local paths of everything in the history window
    pub fn history_paths(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .filter_map(|img| img.local_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
            .collect()
    }

    /// whether both pools hold images
    pub fn has_both_kinds(&self) -> bool {
        let inner = self.lock();
        !inner.local_images.is_empty() && !inner.rss_images.is_empty()
    }

    /// whether the queue holds no images at all
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.local_images.is_empty() && inner.rss_images.is_empty()
    }

    /// change the local/feed ratio
    pub fn set_local_ratio(&self, ratio: u8) {
        let mut inner = self.lock();
        let clamped = ratio.min(100);
        if clamped != inner.local_ratio {
            info!("local ratio changed: {}% -> {}%", inner.local_ratio, clamped);
            inner.local_ratio = clamped;
        }
    }

    /// enable or disable shuffling
    pub fn set_shuffle_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        if inner.shuffle_enabled == enabled {
            return;
        }
        inner.shuffle_enabled = enabled;
        if enabled {
            let mut rng = rand::rng();
            inner.local_queue.make_contiguous().shuffle(&mut rng);
            inner.rss_queue.make_contiguous().shuffle(&mut rng);
        }
        info!("shuffle {}", if enabled { "enabled" } else { "disabled" });
    }

    /// queue statistics
    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let shown = inner.local_served + inner.rss_served;
        let pct = |part: u64| {
            if shown == 0 {
                0.0
            } else {
                (part as f64 / shown as f64 * 1000.0).round() / 10.0
            }
        };
        QueueStats {
            total_images: inner.local_images.len() + inner.rss_images.len(),
            local_pool_total: inner.local_images.len(),
            rss_pool_total: inner.rss_images.len(),
            local_pool_remaining: inner.local_queue.len(),
            rss_pool_remaining: inner.rss_queue.len(),
            history_len: inner.history.len(),
            wrap_count: inner.wrap_count,
            shuffle_enabled: inner.shuffle_enabled,
            local_ratio_setting: inner.local_ratio,
            local_shown: inner.local_served,
            rss_shown: inner.rss_served,
            actual_local_pct: pct(inner.local_served),
            actual_rss_pct: pct(inner.rss_served),
            current: inner.current.as_ref().map(ImageRef::key),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    fn extend_queue(queue: &mut VecDeque<ImageRef>, mut images: Vec<ImageRef>, shuffle: bool) {
        if shuffle {
            images.shuffle(&mut rand::rng());
        }
        queue.extend(images);
    }

    /// pick which pool the next image should come from
    ///
    /// single-populated pools win outright. a small feed pool biases hard
    /// toward local (90% under 5 uniques, 80% under 10) so the same few
    /// feed images do not loop; otherwise the configured ratio decides.
    fn should_use_local(inner: &QueueInner) -> bool {
        let has_local = !inner.local_images.is_empty();
        let has_rss = !inner.rss_images.is_empty();
        match (has_local, has_rss) {
            (true, false) => return true,
            (false, true) => return false,
            (false, false) => return true,
            (true, true) => {}
        }

        let rss_pool = inner.rss_images.len();
        let local_chance = if rss_pool < 5 {
            90
        } else if rss_pool < 10 {
            80
        } else {
            inner.local_ratio as i32
        };
        rand::rng().random_range(0..100) < local_chance
    }

    fn pop_from(inner: &mut QueueInner, pool: Pool) -> Option<ImageRef> {
        let (queue_empty, membership_empty) = match pool {
            Pool::Local => (inner.local_queue.is_empty(), inner.local_images.is_empty()),
            Pool::Rss => (inner.rss_queue.is_empty(), inner.rss_images.is_empty()),
        };
        if queue_empty {
            if membership_empty {
                return None;
            }
            Self::rebuild_pool(inner, pool);
            inner.wrap_count += 1;
        }
        match pool {
            Pool::Local => inner.local_queue.pop_front(),
            Pool::Rss => inner.rss_queue.pop_front(),
        }
    }

    fn rebuild_pool(inner: &mut QueueInner, pool: Pool) {
        let mut refill = match pool {
            Pool::Local => inner.local_images.clone(),
            Pool::Rss => inner.rss_images.clone(),
        };
        if inner.shuffle_enabled {
            refill.shuffle(&mut rand::rng());
        }
        match pool {
            Pool::Local => inner.local_queue.extend(refill),
            Pool::Rss => inner.rss_queue.extend(refill),
        }
        debug!("{:?} queue rebuilt", pool);
    }

    fn in_recent_history(inner: &QueueInner, candidate: &ImageRef) -> bool {
        let key = candidate.key();
        if key.is_empty() {
            return false;
        }
        let lookback = match candidate.source_kind {
            SourceKind::Folder => LOCAL_LOOKBACK,
            SourceKind::Rss => RSS_LOOKBACK,
        };
        inner
            .history
            .iter()
            .rev()
            .take(lookback)
            .any(|img| img.key() == key)
    }
}
