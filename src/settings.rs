//! settings loading and the store handle passed to the engine
use {
    crate::error::Result,
    config::Config,
    std::{
        path::PathBuf,
        sync::{Arc, RwLock},
    },
    tracing::{info, warn},
};

pub mod options;

pub use options::*;

/// shared handle to the live settings
///
/// the engine and its collaborators hold clones of this instead of reading
/// any global state. reads take a value snapshot; the only writers in the
/// core are the transition cycling path and the host.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Settings>>,
    file_path: Option<PathBuf>,
}

impl SettingsStore {
    /// wrap an already-loaded settings value
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            file_path: None,
        }
    }

    /// load settings from `driftsaver.toml` + `DRIFTSAVER_*` env overrides
    ///
    /// lookup order: the user's config directory, then the working
    /// directory, then the environment, later sources winning.
    ///
    /// # Errors
    ///
    /// returns an error if the file exists but cannot be parsed
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(config_dir) = dirs::config_dir() {
            let user_file = config_dir.join("driftsaver").join("driftsaver.toml");
            builder = builder
                .add_source(config::File::from(user_file.as_path()).required(false));
        }
        let builder = builder
            .add_source(config::File::with_name("driftsaver").required(false))
            .add_source(config::Environment::with_prefix("DRIFTSAVER").separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => match cfg.try_deserialize::<Settings>() {
                Ok(s) => s,
                Err(e) => {
                    warn!("settings file invalid, using defaults: {}", e);
                    Settings::default()
                }
            },
            Err(e) => {
                warn!("settings sources unavailable, using defaults: {}", e);
                Settings::default()
            }
        };

        let settings = settings.validated();
        info!(
            "settings loaded (interval={}s, folders={}, feeds={})",
            settings.timing.interval,
            settings.sources.folders.len(),
            settings.sources.rss_feeds.len()
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
            file_path: Some(PathBuf::from("driftsaver.toml")),
        })
    }

    /// take a snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// mutate the live settings in place
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        f(&mut guard);
    }

    /// persist the current settings back to the config file
    ///
    /// a store without a backing file (tests, embedded hosts) saves nothing.
    ///
    /// # Errors
    ///
    /// returns an error if serialization or the write fails
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let snapshot = self.get();
        let rendered = toml::to_string_pretty(&snapshot)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}
