//! the engine: owns the queue, caches, coordinator, timers, and dispatch
use {
    crate::{
        display::Display,
        engine::{
            refresh::{merge_rss_batch, refresh_period, rss_background_cap},
            state::{EngineState, StateCell},
        },
        error::Result,
        events::{EventBus, EventKind, ScopedSubscription},
        images::{
            cache::ImageCache,
            decode::{self, DecodedImage},
            prefetch::{PrefetchOutcome, Prefetcher},
        },
        models::ImageRef,
        queue::ImageQueue,
        rss::{coordinator::RssCoordinator, ratelimit::RateLimiter},
        settings::{Settings, SettingsStore},
        sources::folder::FolderSource,
    },
    hashbrown::HashSet,
    rand::seq::IndexedRandom,
    serde_json::json,
    std::{
        path::PathBuf,
        sync::Arc,
        time::Instant,
    },
    tokio::sync::mpsc,
    tracing::{debug, error, info, warn},
};

pub mod refresh;
pub mod state;

/// transition types in cycling order
const TRANSITION_TYPES: [&str; 6] = [
    "Crossfade",
    "Slide",
    "Wipe",
    "Diffuse",
    "Block Puzzle Flip",
    "Blinds",
];

/// transitions that need hardware acceleration
const GL_ONLY_TRANSITIONS: [&str; 1] = ["Blinds"];

/// how many fallback images a tick tries before giving up
const DISPLAY_RETRY_LIMIT: usize = 10;

/// worker results marshaled back to the engine task
#[derive(Debug)]
pub enum EngineMsg {
    /// a full load pass finished (new downloads only)
    InitialLoad(Vec<ImageRef>),

    /// a background single-feed refresh finished
    RefreshLoad(Vec<ImageRef>),
}

/// diagnostics snapshot, see [`Engine::stats`]
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub state: EngineState,
    pub queue: crate::queue::QueueStats,
    pub decoded_cached: usize,
    pub decoded_bytes: u64,
    pub decoded_hit_rate: f64,
    pub folder_sources: usize,
    pub feed_count: usize,
    pub coordinator_state: Option<crate::rss::coordinator::CoordinatorState>,
    pub monitors: usize,
}

/// what woke the engine loop up
enum Wakeup {
    Rotation,
    Refresh,
    Batch(EngineMsg),
    Decoded(PrefetchOutcome),
    Host(Control),
}

/// host requests delivered through the engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Next,
    Previous,
    Stop { exit_app: bool },
    SourcesChanged,
    CycleTransition,
    SettingsChanged,
    MonitorsChanged,
}

/// cloneable handle the host uses to drive a running engine
#[derive(Clone)]
pub struct EngineHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl EngineHandle {
    /// advance to the next image now
    pub fn next(&self) {
        let _ = self.control.send(Control::Next);
    }

    /// go back to the previous image
    pub fn previous(&self) {
        let _ = self.control.send(Control::Previous);
    }

    /// stop the engine; `exit_app` makes the shutdown terminal
    pub fn stop(&self, exit_app: bool) {
        let _ = self.control.send(Control::Stop { exit_app });
    }

    /// sources were reconfigured; rebuild without aborting feed work
    pub fn sources_changed(&self) {
        let _ = self.control.send(Control::SourcesChanged);
    }

    /// cycle to the next transition type
    pub fn cycle_transition(&self) {
        let _ = self.control.send(Control::CycleTransition);
    }

    /// timing or queue settings changed
    pub fn settings_changed(&self) {
        let _ = self.control.send(Control::SettingsChanged);
    }

    /// the monitor set changed
    pub fn monitors_changed(&self) {
        let _ = self.control.send(Control::MonitorsChanged);
    }
}

/// the screensaver engine
///
/// all queue and cache mutation happens on the task driving [`Engine::run`];
/// network, disk, and decode work runs on spawned tasks whose results come
/// back over channels. the state machine distinguishes `Stopping` (raises
/// the shutdown predicate) from `Reinitializing` (does not), so changing
/// sources never cancels in-flight feed loads.
pub struct Engine {
    settings: SettingsStore,
    events: Arc<EventBus>,
    display: Arc<dyn Display>,
    state: StateCell,
    limiter: Arc<RateLimiter>,
    queue: Arc<ImageQueue>,
    image_cache: Arc<ImageCache>,
    prefetcher: Prefetcher,
    coordinator: Option<Arc<RssCoordinator>>,
    folder_sources: Vec<FolderSource>,
    preloaded: bool,
    transition_index: usize,
    timing_dirty: bool,
    msg_tx: mpsc::UnboundedSender<EngineMsg>,
    msg_rx: mpsc::UnboundedReceiver<EngineMsg>,
    prefetch_rx: mpsc::UnboundedReceiver<PrefetchOutcome>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    subscriptions: Vec<ScopedSubscription>,
}

impl Engine {
    /// wire up an engine; no I/O happens until [`Engine::initialize`]
    pub fn new(settings: SettingsStore, display: Arc<dyn Display>, events: Arc<EventBus>) -> Self {
        let s = settings.get();
        let queue = Arc::new(ImageQueue::new(
            s.queue.shuffle,
            s.queue.history_size,
            s.queue.local_ratio,
        ));
        let image_cache = Arc::new(ImageCache::new(s.cache.max_items, s.cache.max_memory_mb));

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let prefetcher = Prefetcher::new(image_cache.clone(), s.cache.max_concurrent, prefetch_tx);

        Self {
            settings,
            events,
            display,
            state: StateCell::new(),
            limiter: Arc::new(RateLimiter::new()),
            queue,
            image_cache,
            prefetcher,
            coordinator: None,
            folder_sources: Vec::new(),
            preloaded: false,
            transition_index: 0,
            timing_dirty: false,
            msg_tx,
            msg_rx,
            prefetch_rx,
            control_tx,
            control_rx,
            subscriptions: Vec::new(),
        }
    }

    /// a handle for driving the engine from other tasks
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: self.control_tx.clone(),
        }
    }

    /// the engine's event bus
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// build sources, queue contents, and the feed pipeline
    ///
    /// # Errors
    ///
    /// returns an error when called from the wrong state or when the feed
    /// pipeline cannot be constructed; the engine falls back to
    /// `Uninitialized` in that case
    pub fn initialize(&mut self) -> Result<()> {
        self.state.transition(EngineState::Initializing)?;

        match self.initialize_inner() {
            Ok(()) => {
                self.state.transition(EngineState::Stopped)?;
                info!("engine initialisation complete");
                Ok(())
            }
            Err(e) => {
                error!("engine initialisation failed: {}", e);
                let _ = self.state.transition(EngineState::Uninitialized);
                Err(e)
            }
        }
    }

    fn initialize_inner(&mut self) -> Result<()> {
        let s = self.settings.get();

        self.transition_index = TRANSITION_TYPES
            .iter()
            .position(|t| *t == s.transitions.kind)
            .unwrap_or(0);

        self.rebuild_sources(&s)?;

        let control = self.control_tx.clone();
        self.subscriptions.push(ScopedSubscription::new(
            &self.events,
            EventKind::SettingsChanged.as_str(),
            50,
            move |_| {
                let _ = control.send(Control::SettingsChanged);
            },
        ));
        let control = self.control_tx.clone();
        self.subscriptions.push(ScopedSubscription::new(
            &self.events,
            EventKind::MonitorsChanged.as_str(),
            50,
            move |_| {
                let _ = control.send(Control::MonitorsChanged);
            },
        ));

        Ok(())
    }

    /// scan folders, reset the queue, and (re)build the coordinator
    fn rebuild_sources(&mut self, s: &Settings) -> Result<()> {
        self.folder_sources = s
            .sources
            .folders
            .iter()
            .map(|path| FolderSource::new(path.clone(), s.sources.folders_recursive))
            .collect();

        let mut local_images = Vec::new();
        for source in &self.folder_sources {
            local_images.extend(source.scan());
        }

        // feeds are only contacted when the host configured them
        self.coordinator = if s.sources.rss_feeds.is_empty() {
            None
        } else {
            Some(Arc::new(RssCoordinator::new(
                &s.sources,
                &s.http,
                self.limiter.clone(),
                self.state.shutdown_flag(),
                None,
            )?))
        };
        self.preloaded = false;

        if local_images.is_empty() && self.coordinator.is_none() {
            error!("no image sources configured; the display will show a placeholder");
        }

        self.queue.replace(local_images);
        Ok(())
    }

    /// show the first image, start feed loading, and enter `Running`
    ///
    /// # Errors
    ///
    /// returns an error when called from the wrong state
    pub async fn start(&mut self) -> Result<()> {
        self.state.transition(EngineState::Starting)?;

        if let Some(coordinator) = &self.coordinator {
            let tx = self.msg_tx.clone();
            coordinator.load_async(move |new_images| {
                let _ = tx.send(EngineMsg::InitialLoad(new_images));
            });
        }

        self.rotation_tick().await;
        self.state.transition(EngineState::Running)?;
        Ok(())
    }

    /// stop rotating; with `exit_app` the engine becomes unusable
    pub async fn stop(&mut self, exit_app: bool) {
        if self.state.transition(EngineState::Stopping).is_ok() {
            if let Some(coordinator) = &self.coordinator {
                coordinator.request_stop();
            }
            self.display.clear();
            let _ = self.state.transition(EngineState::Stopped);
            info!("engine stopped (exit_app={})", exit_app);
        }
        // process exit is terminal from any state
        if exit_app {
            let _ = self.state.transition(EngineState::ShuttingDown);
        }
    }

    /// rebuild sources and queue after reconfiguration
    ///
    /// runs under `Reinitializing`, which leaves the shutdown predicate
    /// down: loads already in flight complete and their results are merged
    /// into the new queue (or dropped if their feed is gone).
    pub async fn sources_changed(&mut self) {
        let was_running = self.state.get() == EngineState::Running;
        if was_running && self.state.transition(EngineState::Reinitializing).is_err() {
            return;
        }
        info!("sources changed, reinitialising");

        self.image_cache.clear();
        self.prefetcher.clear_inflight();

        let s = self.settings.get();
        if let Err(e) = self.rebuild_sources(&s) {
            warn!("source rebuild failed: {}", e);
        }

        if let Some(coordinator) = &self.coordinator {
            let tx = self.msg_tx.clone();
            coordinator.load_async(move |new_images| {
                let _ = tx.send(EngineMsg::InitialLoad(new_images));
            });
        }

        if was_running {
            let _ = self.state.transition(EngineState::Running);
            info!("sources reinitialisation complete, engine back to running");
        }
    }

    /// drive the engine until shutdown
    pub async fn run(mut self) {
        let mut s = self.settings.get();
        let mut rotation = Self::interval_from_now(s.timing.interval.max(1));
        let mut refresh = tokio::time::interval_at(
            (Instant::now() + refresh_period(&s)).into(),
            refresh_period(&s),
        );

        loop {
            if self.state.get() == EngineState::ShuttingDown {
                break;
            }
            if self.timing_dirty {
                s = self.settings.get();
                rotation = Self::interval_from_now(s.timing.interval.max(1));
                refresh = tokio::time::interval_at(
                    (Instant::now() + refresh_period(&s)).into(),
                    refresh_period(&s),
                );
                self.queue.set_shuffle_enabled(s.queue.shuffle);
                self.queue.set_local_ratio(s.queue.local_ratio);
                self.timing_dirty = false;
                info!("timing settings reloaded (interval={}s)", s.timing.interval);
            }

            // resolve the wakeup first so the handlers below get an
            // unencumbered &mut self
            let wakeup = tokio::select! {
                _ = rotation.tick() => Wakeup::Rotation,
                _ = refresh.tick() => Wakeup::Refresh,
                Some(msg) = self.msg_rx.recv() => Wakeup::Batch(msg),
                Some(outcome) = self.prefetch_rx.recv() => Wakeup::Decoded(outcome),
                Some(ctrl) = self.control_rx.recv() => Wakeup::Host(ctrl),
            };

            match wakeup {
                Wakeup::Rotation => {
                    if self.state.get() == EngineState::Running {
                        self.rotation_tick().await;
                    }
                }
                Wakeup::Refresh => self.refresh_tick(),
                Wakeup::Batch(msg) => self.on_msg(msg),
                Wakeup::Decoded(outcome) => self.on_decoded(outcome),
                Wakeup::Host(ctrl) => self.on_control(ctrl).await,
            }
        }

        self.display.clear();
        info!("engine loop finished");
    }

    fn interval_from_now(seconds: u64) -> tokio::time::Interval {
        let period = std::time::Duration::from_secs(seconds);
        tokio::time::interval_at((Instant::now() + period).into(), period)
    }

    /// one rotation: pick, decode, dispatch, prefetch
    pub async fn rotation_tick(&mut self) {
        if self.state.shutting_down() {
            return;
        }
        let started = Instant::now();
        let s = self.settings.get();

        let mut dispatched = false;
        for _ in 0..DISPLAY_RETRY_LIMIT {
            let Some(image) = self.queue.next() else {
                break;
            };
            if self.show_on_monitor(&image, 0, &s).await {
                dispatched = true;
                break;
            }
        }

        if !dispatched {
            warn!("no image could be displayed this tick");
            self.display.show_error("No images available");
            return;
        }

        if !s.display.same_image_all_monitors {
            for monitor in 1..self.display.monitor_count() {
                if let Some(image) = self.queue.next() {
                    self.show_on_monitor(&image, monitor, &s).await;
                }
            }
        }

        self.schedule_prefetch(&s);

        if s.debug.events_trace {
            debug!("rotation tick dispatched in {:?}", started.elapsed());
        }
    }

    /// decode (preferring a pre-scaled variant) and hand one image to the
    /// display; with same-image mode the one pixmap goes to every monitor
    async fn show_on_monitor(&self, image: &ImageRef, monitor: usize, s: &Settings) -> bool {
        let Some(path) = image.local_path.clone() else {
            debug!("image {} has no local bytes yet", image.key());
            return false;
        };
        let path_str = path.to_string_lossy().into_owned();
        let sizes = self.display.monitor_sizes();

        let mut decoded: Option<DecodedImage> = None;
        if let Some(&(w, h)) = sizes.get(monitor) {
            decoded = self.image_cache.get(&decode::scaled_key(&path_str, w, h));
        }
        if decoded.is_none() {
            decoded = self.image_cache.get(&path_str);
        }
        if decoded.is_none() {
            // on-demand decode on the compute pool
            let decode_path = path.clone();
            decoded = tokio::task::spawn_blocking(move || decode::decode_file(&decode_path))
                .await
                .ok()
                .and_then(|r| r.ok());
            if let Some(img) = &decoded {
                self.image_cache.put(path_str.clone(), img.clone());
            }
        }

        let Some(decoded) = decoded else {
            warn!("failed to decode {:?}", path);
            return false;
        };

        if s.display.same_image_all_monitors && monitor == 0 {
            for m in 0..self.display.monitor_count() {
                self.display.show(m, image, &decoded, &s.display.mode);
            }
        } else {
            self.display.show(monitor, image, &decoded, &s.display.mode);
        }
        true
    }

    /// ask the prefetcher to warm the cache for the upcoming images
    fn schedule_prefetch(&self, s: &Settings) {
        if s.cache.prefetch_ahead == 0 {
            return;
        }
        let paths: Vec<PathBuf> = self
            .queue
            .peek_many(s.cache.prefetch_ahead)
            .into_iter()
            .filter_map(|img| img.local_path)
            .collect();
        if paths.is_empty() {
            return;
        }

        let mut sizes = self.display.monitor_sizes();
        sizes.sort_unstable();
        sizes.dedup();
        self.prefetcher.prefetch(&paths, &sizes);
        debug!("prefetch scheduled for {} upcoming images", paths.len());
    }

    /// one background refresh: pick a random feed and fetch it off-task
    pub fn refresh_tick(&self) {
        if self.state.get() != EngineState::Running {
            return;
        }
        let Some(coordinator) = &self.coordinator else {
            return;
        };

        let s = self.settings.get();
        let cap = rss_background_cap(&s);
        if cap == 0 || self.queue.rss_count() >= cap {
            return;
        }

        let Some(feed_url) = coordinator.feed_urls().choose(&mut rand::rng()).cloned() else {
            return;
        };
        debug!("background refresh: {}", feed_url);

        let coordinator = coordinator.clone();
        let tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let images = coordinator.refresh_single_feed(&feed_url).await;
            let _ = tx.send(EngineMsg::RefreshLoad(images));
        });
    }

    /// apply a worker batch on the engine task
    pub fn on_msg(&mut self, msg: EngineMsg) {
        if self.state.shutting_down() {
            return;
        }
        let s = self.settings.get();
        let allowed = self.allowed_sources();

        match msg {
            EngineMsg::InitialLoad(new_images) => {
                let stats = merge_rss_batch(
                    &self.queue,
                    &self.events,
                    &s,
                    new_images,
                    allowed.as_ref(),
                    false,
                );
                debug!("initial feed load merged: {:?}", stats);
                self.preload_cached(&s);
                self.schedule_prefetch(&s);
                self.report_unhealthy_feeds();
            }
            EngineMsg::RefreshLoad(images) => {
                let stats =
                    merge_rss_batch(&self.queue, &self.events, &s, images, allowed.as_ref(), true);
                if stats.added > 0 {
                    self.schedule_prefetch(&s);
                }
            }
        }
    }

    /// first feed callback: inject images the warm cache found on disk
    fn preload_cached(&mut self, s: &Settings) {
        if self.preloaded {
            return;
        }
        self.preloaded = true;
        let Some(coordinator) = &self.coordinator else {
            return;
        };

        let existing: HashSet<String> = self.queue.all_images().iter().map(ImageRef::key).collect();
        let mut cached: Vec<ImageRef> = coordinator
            .cached_images()
            .into_iter()
            .filter(|img| !existing.contains(&img.key()))
            .collect();

        let rotating = s.sources.rss_rotating_cache_size;
        if cached.len() > rotating {
            use rand::seq::SliceRandom;
            cached.shuffle(&mut rand::rng());
            cached.truncate(rotating);
        }
        if !cached.is_empty() {
            let n = self.queue.add(cached);
            info!("pre-loaded {} cached feed images (cap={})", n, rotating);
        }
    }

    /// surface feeds that backoff has taken out of rotation
    fn report_unhealthy_feeds(&self) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        for (url, status) in coordinator.health_report() {
            if !status.healthy {
                self.events.publish(
                    EventKind::RssFailed.as_str(),
                    json!({
                        "url": url,
                        "error": format!("{} consecutive failures, backing off", status.failures),
                    }),
                );
            }
        }
    }

    /// apply a finished decode on the engine task
    pub fn on_decoded(&mut self, outcome: PrefetchOutcome) {
        let still_queued = self
            .queue
            .all_images()
            .iter()
            .any(|img| img.local_path.as_ref().is_some_and(|p| p.to_string_lossy() == outcome.source_path));
        if !still_queued {
            debug!("dropping decode result for dequeued path {}", outcome.source_path);
            return;
        }

        match outcome.result {
            Ok(image) => {
                self.image_cache.put(outcome.key.clone(), image);
                self.events.publish(
                    EventKind::ImageReady.as_str(),
                    json!({ "path": outcome.key }),
                );
            }
            Err(error) => {
                self.events.publish(
                    EventKind::ImageFailed.as_str(),
                    json!({ "path": outcome.source_path, "error": error }),
                );
            }
        }
    }

    async fn on_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Next => self.rotation_tick().await,
            Control::Previous => self.show_previous().await,
            Control::Stop { exit_app } => self.stop(exit_app).await,
            Control::SourcesChanged => self.sources_changed().await,
            Control::CycleTransition => self.cycle_transition(),
            Control::SettingsChanged => self.timing_dirty = true,
            Control::MonitorsChanged => {
                info!("monitor set changed; dropping scaled variants");
                self.image_cache.clear();
                self.show_current().await;
            }
        }
    }

    /// re-serve the prior history entry without advancing
    async fn show_previous(&mut self) {
        let s = self.settings.get();
        if let Some(image) = self.queue.previous() {
            self.show_on_monitor(&image, 0, &s).await;
        }
    }

    async fn show_current(&mut self) {
        let s = self.settings.get();
        if let Some(image) = self.queue.current() {
            self.show_on_monitor(&image, 0, &s).await;
        }
    }

    /// cycle to the next transition in the pool, honoring hardware limits
    ///
    /// the chosen type is persisted through the settings store; this is the
    /// core's only settings write.
    pub fn cycle_transition(&mut self) {
        let s = self.settings.get();
        let hw = s.display.hw_accel;

        let in_pool = |name: &str| s.transitions.pool.get(name).copied().unwrap_or(true);
        let mut chosen = "Crossfade";
        for _ in 0..TRANSITION_TYPES.len() {
            self.transition_index = (self.transition_index + 1) % TRANSITION_TYPES.len();
            let candidate = TRANSITION_TYPES[self.transition_index];
            if !hw && GL_ONLY_TRANSITIONS.contains(&candidate) {
                continue;
            }
            if !in_pool(candidate) {
                continue;
            }
            chosen = candidate;
            break;
        }

        self.settings.update(|s| s.transitions.kind = chosen.to_string());
        if let Err(e) = self.settings.save() {
            warn!("failed to persist transition choice: {}", e);
        }
        info!("transition cycled to: {}", chosen);
    }

    /// a point-in-time view across the engine's subsystems
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state.get(),
            queue: self.queue.stats(),
            decoded_cached: self.image_cache.size(),
            decoded_bytes: self.image_cache.total_bytes(),
            decoded_hit_rate: self.image_cache.stats().hit_rate(),
            folder_sources: self.folder_sources.len(),
            feed_count: self
                .coordinator
                .as_ref()
                .map(|c| c.feed_urls().len())
                .unwrap_or(0),
            coordinator_state: self.coordinator.as_ref().map(|c| c.state()),
            monitors: self.display.monitor_count(),
        }
    }

    fn allowed_sources(&self) -> Option<HashSet<String>> {
        self.coordinator.as_ref().map(|coordinator| {
            let mut set: HashSet<String> =
                coordinator.feed_urls().iter().cloned().collect();
            set.insert("cached".to_string());
            set
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::display::ConsoleDisplay,
        crate::models::SourceKind,
        chrono::Utc,
        image::DynamicImage,
        std::path::Path,
    };

    fn folder_with_images(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("img{i}.png"));
                DynamicImage::new_rgb8(16, 16).save(&path).unwrap();
                path
            })
            .collect()
    }

    fn engine_with_folder(dir: &Path) -> (Engine, Arc<ConsoleDisplay>) {
        let mut settings = Settings::default();
        settings.sources.folders = vec![dir.to_path_buf()];
        settings.queue.shuffle = false;
        let display = Arc::new(ConsoleDisplay::default());
        let engine = Engine::new(
            SettingsStore::new(settings),
            display.clone(),
            Arc::new(EventBus::new()),
        );
        (engine, display)
    }

    fn remote_img(n: usize) -> ImageRef {
        let mut img = ImageRef::remote(
            "https://feed.example/rss",
            format!("r{n}.jpg"),
            format!("https://img.example/r{n}.jpg"),
        );
        img.local_path = Some(PathBuf::from(format!("/cache/r{n}.jpg")));
        img.fetched_at = Some(Utc::now());
        img
    }

    #[tokio::test]
    async fn test_lifecycle_stop_and_restart() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 3);
        let (mut engine, _display) = engine_with_folder(tmp.path());

        assert_eq!(engine.state(), EngineState::Uninitialized);
        engine.initialize().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        // pausing for the settings dialog leaves the engine restartable
        engine.stop(false).await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.state.shutting_down());

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop(true).await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
        assert!(engine.state.shutting_down());
    }

    #[tokio::test]
    async fn test_initialize_from_wrong_state_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();
        assert!(engine.initialize().is_err());
        assert_eq!(engine.state(), EngineState::Stopped, "state is untouched");
    }

    #[tokio::test]
    async fn test_rotation_dispatches_to_display() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 3);
        let (mut engine, display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.rotation_tick().await;
        let shown = display.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, 0);
        // the decoded image landed in the cache on demand
        assert!(engine.image_cache.size() >= 1);
    }

    #[tokio::test]
    async fn test_rotation_with_empty_queue_shows_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.rotation_tick().await;
        assert!(display.shown().is_empty());
        assert_eq!(display.errors(), vec!["No images available".to_string()]);
    }

    #[tokio::test]
    async fn test_initial_load_publishes_rss_updated() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.on_msg(EngineMsg::InitialLoad(vec![remote_img(0), remote_img(1), remote_img(2)]));

        assert_eq!(engine.queue.rss_count(), 3);
        let history = engine.events.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "rss.updated");
        let payload = history[0].payload.as_ref().unwrap();
        assert_eq!(payload["added"], 3);
        assert_eq!(payload["total_rss"], 3);
    }

    #[tokio::test]
    async fn test_refresh_dedupe_publishes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.on_msg(EngineMsg::InitialLoad(vec![remote_img(0)]));
        let events_before = engine.events.history(10).len();

        // the same image surfaces again on a background refresh
        engine.on_msg(EngineMsg::RefreshLoad(vec![remote_img(0)]));
        assert_eq!(engine.queue.rss_count(), 1);
        assert_eq!(engine.events.history(10).len(), events_before);
    }

    #[tokio::test]
    async fn test_sources_changed_keeps_engine_running() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 2);
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();
        engine.start().await.unwrap();

        engine.on_msg(EngineMsg::InitialLoad(vec![remote_img(0)]));
        engine.sources_changed().await;

        assert_eq!(engine.state(), EngineState::Running);
        assert!(!engine.state.shutting_down(), "reconfiguration must not abort feed work");
        // feed pool was rebuilt from the (feedless) settings
        assert_eq!(engine.queue.rss_count(), 0);
        assert_eq!(engine.queue.stats().local_pool_total, 2);
    }

    #[tokio::test]
    async fn test_in_flight_batch_merges_after_reinitialize() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 2);
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();
        engine.start().await.unwrap();

        engine.sources_changed().await;
        // a load that was in flight across the reinitialize now lands; with
        // no coordinator configured there is no source filter to drop it
        engine.on_msg(EngineMsg::InitialLoad(vec![remote_img(7)]));
        assert_eq!(engine.queue.rss_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_decode_results_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.on_decoded(PrefetchOutcome {
            key: "/gone/a.png".into(),
            source_path: "/gone/a.png".into(),
            result: Ok(Arc::new(DynamicImage::new_rgb8(4, 4))),
        });
        assert_eq!(engine.image_cache.size(), 0);
        assert!(engine.events.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_decode_results_for_queued_paths_are_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = folder_with_images(tmp.path(), 1);
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        let key = paths[0].to_string_lossy().into_owned();
        engine.on_decoded(PrefetchOutcome {
            key: key.clone(),
            source_path: key.clone(),
            result: Ok(Arc::new(DynamicImage::new_rgb8(4, 4))),
        });
        assert_eq!(engine.image_cache.size(), 1);
        let history = engine.events.history(10);
        assert_eq!(history[0].event_type, "image.ready");
    }

    #[tokio::test]
    async fn test_cycle_transition_respects_pool_and_hw() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.sources.folders = vec![tmp.path().to_path_buf()];
        settings.display.hw_accel = false;
        settings.transitions.kind = "Block Puzzle Flip".to_string();
        settings.transitions.pool.insert("Crossfade".to_string(), false);

        let store = SettingsStore::new(settings);
        let mut engine = Engine::new(
            store.clone(),
            Arc::new(ConsoleDisplay::default()),
            Arc::new(EventBus::new()),
        );
        engine.initialize().unwrap();

        // from Block Puzzle Flip: Blinds is GL-only, Crossfade is out of the
        // pool, so the cycle lands on Slide
        engine.cycle_transition();
        assert_eq!(store.get().transitions.kind, "Slide");
    }

    #[tokio::test]
    async fn test_previous_redisplays_prior_image() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 4);
        let (mut engine, display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();

        engine.rotation_tick().await;
        engine.rotation_tick().await;
        let shown = display.shown();
        let first_key = shown[0].1.clone();

        engine.show_previous().await;
        let shown = display.shown();
        assert_eq!(shown.last().unwrap().1, first_key);
    }

    #[tokio::test]
    async fn test_same_image_on_all_monitors() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 2);
        let mut settings = Settings::default();
        settings.sources.folders = vec![tmp.path().to_path_buf()];
        settings.queue.shuffle = false;

        let display = Arc::new(ConsoleDisplay::new(vec![(1920, 1080), (2560, 1440)]));
        let mut engine = Engine::new(
            SettingsStore::new(settings),
            display.clone(),
            Arc::new(EventBus::new()),
        );
        engine.initialize().unwrap();
        engine.rotation_tick().await;

        let shown = display.shown();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].1, shown[1].1, "both monitors get the same image");
        assert_eq!(shown[1].0, 1);
    }

    #[tokio::test]
    async fn test_per_monitor_images_advance_the_queue() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 4);
        let mut settings = Settings::default();
        settings.sources.folders = vec![tmp.path().to_path_buf()];
        settings.queue.shuffle = false;
        settings.display.same_image_all_monitors = false;

        let display = Arc::new(ConsoleDisplay::new(vec![(1920, 1080), (2560, 1440)]));
        let mut engine = Engine::new(
            SettingsStore::new(settings),
            display.clone(),
            Arc::new(EventBus::new()),
        );
        engine.initialize().unwrap();
        engine.rotation_tick().await;

        let shown = display.shown();
        assert_eq!(shown.len(), 2);
        assert_ne!(shown[0].1, shown[1].1, "each monitor gets its own image");
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 2);
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();
        engine.rotation_tick().await;

        let stats = engine.stats();
        assert_eq!(stats.state, EngineState::Stopped);
        assert_eq!(stats.folder_sources, 1);
        assert_eq!(stats.feed_count, 0);
        assert_eq!(stats.monitors, 1);
        assert_eq!(stats.queue.local_pool_total, 2);
        assert!(stats.decoded_cached >= 1);
    }

    #[tokio::test]
    async fn test_preload_respects_rotating_cap_kinds() {
        // preload only applies when a coordinator exists; covered indirectly
        // through merge tests, here we pin that folder items never count as rss
        let tmp = tempfile::tempdir().unwrap();
        folder_with_images(tmp.path(), 3);
        let (mut engine, _display) = engine_with_folder(tmp.path());
        engine.initialize().unwrap();
        assert_eq!(engine.queue.rss_count(), 0);
        assert!(engine.queue.all_images().iter().all(|i| i.source_kind == SourceKind::Folder));
    }
}
