//! background decode of upcoming images with bounded concurrency
use {
    crate::images::{
        cache::ImageCache,
        decode::{self, DecodedImage},
    },
    hashbrown::HashSet,
    std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    },
    tokio::sync::{Semaphore, mpsc},
    tracing::{debug, warn},
};

/// completion of one background decode or pre-scale
///
/// posted to the engine task, which owns cache insertion and drops results
/// whose source path has left the queue.
#[derive(Debug)]
pub struct PrefetchOutcome {
    /// cache key to insert under (the path, or a scaled-variant key)
    pub key: String,

    /// the queue path this work was scheduled for
    pub source_path: String,

    /// the decoded image, or an opaque error description
    pub result: Result<DecodedImage, String>,
}

/// keeps the image cache warm for the queue's upcoming entries
///
/// at most `max_concurrent` decodes run at once behind a semaphore; an
/// inflight set stops duplicate submissions. for the immediate next image,
/// pre-scaled variants are computed per display size, best effort.
pub struct Prefetcher {
    cache: Arc<ImageCache>,
    semaphore: Arc<Semaphore>,
    inflight: Arc<Mutex<HashSet<String>>>,
    results: mpsc::UnboundedSender<PrefetchOutcome>,
}

impl Prefetcher {
    /// make a prefetcher feeding decode results into `results`
    pub fn new(
        cache: Arc<ImageCache>,
        max_concurrent: usize,
        results: mpsc::UnboundedSender<PrefetchOutcome>,
    ) -> Self {
        Self {
            cache,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            results,
        }
    }

    /// ensure each path is decoded; `display_sizes` drives pre-scaling of
    /// the first (immediate next) path
    pub fn prefetch(&self, paths: &[PathBuf], display_sizes: &[(u32, u32)]) {
        for (index, path) in paths.iter().enumerate() {
            let path_str = path.to_string_lossy().into_owned();
            let sizes: Vec<(u32, u32)> = if index == 0 { display_sizes.to_vec() } else { Vec::new() };

            if self.cache.contains(&path_str) {
                // base image already decoded; variants may still be missing
                if !sizes.is_empty()
                    && let Some(base) = self.cache.get(&path_str)
                {
                    self.schedule_prescales(&path_str, base, &sizes);
                }
                continue;
            }

            {
                let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
                if !inflight.insert(path_str.clone()) {
                    continue;
                }
            }

            let path = path.clone();
            let semaphore = self.semaphore.clone();
            let inflight = self.inflight.clone();
            let results = self.results.clone();
            let prescaler = self.clone_for_tasks();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                let decode_path = path.clone();
                let decoded = tokio::task::spawn_blocking(move || decode::decode_file(&decode_path))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));

                let path_str = path.to_string_lossy().into_owned();
                inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&path_str);

                match decoded {
                    Ok(image) => {
                        if !sizes.is_empty() {
                            prescaler.schedule_prescales(&path_str, image.clone(), &sizes);
                        }
                        let _ = results.send(PrefetchOutcome {
                            key: path_str.clone(),
                            source_path: path_str,
                            result: Ok(image),
                        });
                    }
                    Err(error) => {
                        debug!("prefetch decode failed for {}: {}", path_str, error);
                        let _ = results.send(PrefetchOutcome {
                            key: path_str.clone(),
                            source_path: path_str,
                            result: Err(error),
                        });
                    }
                }
            });
        }
    }

    /// compute scaled variants of `base` for each display size, best effort
    fn schedule_prescales(&self, path: &str, base: DecodedImage, sizes: &[(u32, u32)]) {
        for &(width, height) in sizes {
            let key = decode::scaled_key(path, width, height);
            if self.cache.contains(&key) {
                continue;
            }
            let base = base.clone();
            let results = self.results.clone();
            let source_path = path.to_string();
            tokio::spawn(async move {
                let scaled =
                    tokio::task::spawn_blocking(move || decode::prescale(&base, width, height)).await;
                match scaled {
                    Ok(image) => {
                        let _ = results.send(PrefetchOutcome {
                            key,
                            source_path,
                            result: Ok(image),
                        });
                    }
                    Err(e) => warn!("pre-scale task failed: {}", e),
                }
            });
        }
    }

    /// forget scheduled paths after a source reconfiguration
    ///
    /// running tasks finish on their own; the engine discards their results
    /// once the paths are no longer in the queue.
    pub fn clear_inflight(&self) {
        self.inflight.lock().expect("inflight lock poisoned").clear();
    }

    /// number of submissions currently tracked
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("inflight lock poisoned").len()
    }

    fn clone_for_tasks(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            semaphore: self.semaphore.clone(),
            inflight: self.inflight.clone(),
            results: self.results.clone(),
        }
    }
}
