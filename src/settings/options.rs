//! every available configuration option and its type is listed in this file
use {
    schemars::JsonSchema,
    serde::{Deserialize, Serialize},
    smart_default::SmartDefault,
    std::{collections::BTreeMap, path::PathBuf},
    tracing::warn,
};

/// Output format for log lines
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, SmartDefault, PartialEq, Eq)]
pub enum LoggingFormat {
    /// Multi-line human friendly output
    Pretty,

    /// Single line per event
    #[default]
    Compact,
}

/// Configuration options for logging
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging output
    #[default(true)]
    pub enable: bool,

    /// Minimum level (trace/debug/info/warn/error)
    #[default("info".to_owned())]
    pub level: String,

    /// Enable ANSI colors
    #[default(true)]
    pub ansi: bool,

    /// Include source line numbers
    #[default(false)]
    pub line_numbers: bool,

    /// Include event targets
    #[default(false)]
    pub event_targets: bool,

    /// Output format
    pub format: LoggingFormat,
}

/// Configuration options for making HTTP requests
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[default(30)]
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    #[default(10)]
    pub connect_timeout_secs: u64,

    /// Connection pool size per host
    #[default(32)]
    pub pool_max_idle_per_host: usize,

    /// Connection pool idle timeout in seconds
    #[default(90)]
    pub pool_idle_timeout_secs: u64,

    /// Maximum bytes accepted for a single image download
    #[default(50 * 1024 * 1024)]
    pub max_image_bytes: u64,

    /// User agent string sent with every request
    #[default(None)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Rotation timing
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds between image rotations
    #[default(60)]
    pub interval: u64,
}

/// Image source configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct SourcesConfig {
    /// Local folders to scan for images
    pub folders: Vec<PathBuf>,

    /// Scan folders recursively
    #[default(true)]
    pub folders_recursive: bool,

    /// Feed urls (rss/atom xml, flickr json, reddit json)
    pub rss_feeds: Vec<String>,

    /// Override for the dynamic background cap on queued feed images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_background_cap: Option<u32>,

    /// Override for the stale TTL in minutes; <= 0 disables stale eviction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_stale_minutes: Option<i64>,

    /// Minutes between background feed refreshes
    #[default(10)]
    pub rss_refresh_minutes: u64,

    /// Override for the disk cache directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_cache_directory: Option<PathBuf>,

    /// Mirror downloaded feed images into a user folder
    #[default(false)]
    pub rss_save_to_disk: bool,

    /// Destination folder for mirrored downloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_save_directory: Option<PathBuf>,

    /// How many cached feed images to inject into the queue at startup
    #[default(20)]
    pub rss_rotating_cache_size: usize,

    /// On-disk feed cache size cap in MB
    #[default(500)]
    pub rss_max_cache_mb: u64,
}

/// Rotation queue configuration
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Shuffle pools on build and on wraparound
    #[default(true)]
    pub shuffle: bool,

    /// How many served images the history remembers
    #[default(50)]
    pub history_size: usize,

    /// Percentage of served images taken from local folders (0-100)
    #[default(60)]
    pub local_ratio: u8,
}

/// Decoded image cache and prefetch configuration
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum decoded images held in memory
    #[default(24)]
    pub max_items: usize,

    /// Maximum decoded bytes held in memory, in MB
    #[default(1024)]
    pub max_memory_mb: u64,

    /// Maximum concurrent background decodes
    #[default(2)]
    pub max_concurrent: usize,

    /// How many upcoming queue entries to prefetch
    #[default(5)]
    pub prefetch_ahead: usize,
}

/// Display dispatch configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct DisplayConfig {
    /// Show the same image on every monitor
    #[default(true)]
    pub same_image_all_monitors: bool,

    /// Scaling mode passed through to the display collaborator
    #[default("fill".to_owned())]
    pub mode: String,

    /// Whether hardware accelerated transitions are available
    #[default(false)]
    pub hw_accel: bool,
}

/// Transition selection configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct TransitionsConfig {
    /// The active transition type
    #[default("Crossfade".to_owned())]
    pub kind: String,

    /// Per-type membership in the cycling pool; absent types are included
    pub pool: BTreeMap<String, bool>,
}

/// Debug toggles
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct DebugConfig {
    /// Emit per-dispatch timing traces
    #[default(false)]
    pub events_trace: bool,
}

/// Root of the settings tree
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, SmartDefault)]
#[serde(default)]
pub struct Settings {
    /// Rotation timing
    pub timing: TimingConfig,

    /// Image sources
    pub sources: SourcesConfig,

    /// Rotation queue behaviour
    pub queue: QueueConfig,

    /// Decoded cache and prefetch
    pub cache: CacheConfig,

    /// Display dispatch
    pub display: DisplayConfig,

    /// Transition selection
    pub transitions: TransitionsConfig,

    /// HTTP client tuning
    pub http: HttpConfig,

    /// Logging output
    pub logging: LoggingConfig,

    /// Debug toggles
    pub debug: DebugConfig,
}

impl Settings {
    /// clamp out-of-range values and drop unusable overrides
    pub fn validated(mut self) -> Self {
        if self.timing.interval == 0 {
            warn!("timing.interval of 0 is not usable, falling back to 60s");
            self.timing.interval = 60;
        }
        if self.queue.local_ratio > 100 {
            warn!("queue.local_ratio clamped to 100");
            self.queue.local_ratio = 100;
        }
        if self.cache.max_concurrent == 0 {
            self.cache.max_concurrent = 1;
        }
        // decoding more images at once than there are cores buys nothing
        self.cache.max_concurrent = self.cache.max_concurrent.min(num_cpus::get().max(1));
        if let Some(dir) = &self.sources.rss_cache_directory
            && std::fs::create_dir_all(dir).is_err()
        {
            warn!(
                "sources.rss_cache_directory {:?} is not writable, using the default",
                dir
            );
            self.sources.rss_cache_directory = None;
        }
        if self.sources.rss_save_to_disk {
            match &self.sources.rss_save_directory {
                Some(dir) if std::fs::create_dir_all(dir).is_ok() => {}
                _ => {
                    warn!("rss_save_to_disk enabled without a usable save directory, disabling");
                    self.sources.rss_save_to_disk = false;
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.timing.interval, 60);
        assert_eq!(s.queue.history_size, 50);
        assert_eq!(s.queue.local_ratio, 60);
        assert_eq!(s.cache.max_items, 24);
        assert_eq!(s.cache.prefetch_ahead, 5);
        assert_eq!(s.sources.rss_refresh_minutes, 10);
        assert!(s.display.same_image_all_monitors);
    }

    #[test]
    fn test_validated_clamps_bad_values() {
        let mut s = Settings::default();
        s.timing.interval = 0;
        s.queue.local_ratio = 250;
        s.cache.max_concurrent = 0;
        let s = s.validated();
        assert_eq!(s.timing.interval, 60);
        assert_eq!(s.queue.local_ratio, 100);
        assert_eq!(s.cache.max_concurrent, 1);
    }

    #[test]
    fn test_validated_disables_save_without_directory() {
        let mut s = Settings::default();
        s.sources.rss_save_to_disk = true;
        s.sources.rss_save_directory = None;
        let s = s.validated();
        assert!(!s.sources.rss_save_to_disk);
    }
}
