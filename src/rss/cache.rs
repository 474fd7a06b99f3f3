//! on-disk cache of downloaded feed images
use {
    crate::models::{ImageRef, SourceKind},
    chrono::{DateTime, Utc},
    hashbrown::HashSet,
    std::{
        fs,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, RwLock},
        time::SystemTime,
    },
    tracing::{debug, error, info, warn},
};

/// how many cached files to load at startup, newest first
pub const MAX_CACHED_TO_LOAD: usize = 35;

/// never evict below this many files
pub const MIN_CACHE_BEFORE_CLEANUP: usize = 20;

/// default on-disk size cap
pub const DEFAULT_MAX_CACHE_MB: u64 = 500;

/// smallest file accepted as a real image
const MIN_VALID_FILE_BYTES: u64 = 100;

/// extensions the startup scan considers
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

/// prefix used by in-progress downloads; cleanup must never touch these
pub const TEMP_PREFIX: &str = ".tmp.";

/// manages the on-disk feed image cache and its in-memory index
///
/// filenames are content-addressed as `md5(url) + ext`, so concurrent
/// downloads of the same url collapse onto one file. the in-memory image
/// list is copy-on-write: writers build a fresh list and swap the shared
/// reference, readers snapshot it without blocking.
pub struct DiskCache {
    cache_dir: PathBuf,
    max_cache_bytes: u64,
    images: RwLock<Arc<Vec<ImageRef>>>,
    cached_hashes: Mutex<HashSet<String>>,
}

impl DiskCache {
    /// open (creating if needed) a cache under `cache_dir`
    ///
    /// # Errors
    ///
    /// returns an error if the directory cannot be created
    pub fn new(cache_dir: Option<PathBuf>, max_cache_mb: u64) -> crate::error::Result<Self> {
        let cache_dir =
            cache_dir.unwrap_or_else(|| std::env::temp_dir().join("screensaver_rss_cache"));
        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            max_cache_bytes: max_cache_mb * 1024 * 1024,
            images: RwLock::new(Arc::new(Vec::new())),
            cached_hashes: Mutex::new(HashSet::new()),
        })
    }

    /// the directory files live in
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// snapshot of the in-memory image list (safe from any thread)
    pub fn images(&self) -> Arc<Vec<ImageRef>> {
        self.images.read().expect("disk cache lock poisoned").clone()
    }

    /// number of images in the in-memory index
    pub fn count(&self) -> usize {
        self.images().len()
    }

    /// set of local paths for duplicate detection
    pub fn existing_paths(&self) -> HashSet<PathBuf> {
        self.images()
            .iter()
            .filter_map(|img| img.local_path.clone())
            .collect()
    }

    /// append one image via copy-on-write
    pub fn add(&self, image: ImageRef) {
        let mut guard = self.images.write().expect("disk cache lock poisoned");
        let mut next = guard.as_ref().clone();
        next.push(image);
        *guard = Arc::new(next);
    }

    /// expected cache path for a url (does not download)
    pub fn cache_path_for(&self, image_url: &str) -> PathBuf {
        cache_path(&self.cache_dir, image_url)
    }

    /// whether a url was already downloaded this run or loaded from disk
    pub fn is_cached(&self, image_url: &str) -> bool {
        let hash = format!("{:x}", md5::compute(image_url.as_bytes()));
        self.cached_hashes
            .lock()
            .expect("cached url lock poisoned")
            .contains(&hash)
    }

    /// remember a url as cached
    pub fn mark_cached(&self, image_url: &str) {
        let hash = format!("{:x}", md5::compute(image_url.as_bytes()));
        self.cached_hashes
            .lock()
            .expect("cached url lock poisoned")
            .insert(hash);
    }

    /// load cached images from disk for instant startup availability
    ///
    /// scans the newest [`MAX_CACHED_TO_LOAD`] files by mtime, deletes any
    /// that fail validation, and atomically replaces the in-memory list.
    /// idempotent. returns the loaded images.
    pub fn load_from_disk(&self) -> Vec<ImageRef> {
        let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to scan cache dir {:?}: {}", self.cache_dir, e);
                return Vec::new();
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext_ok = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()));
            if !ext_ok {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push((path, mtime, meta.len()));
            }
        }

        if candidates.is_empty() {
            return Vec::new();
        }

        // newest first for freshness
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(MAX_CACHED_TO_LOAD);

        let mut loaded = Vec::new();
        let mut removed = 0usize;

        for (path, mtime, size) in candidates {
            if size < MIN_VALID_FILE_BYTES || !validate_image_header(&path) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("failed to remove corrupt cache file {:?}: {}", path, e);
                }
                removed += 1;
                continue;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let format = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_uppercase());

            loaded.push(ImageRef {
                source_kind: SourceKind::Rss,
                source_id: "cached".to_string(),
                image_id: name,
                local_path: Some(path.clone()),
                url: None,
                title: Some(stem.clone()),
                description: None,
                author: None,
                created_at: None,
                fetched_at: Some(DateTime::<Utc>::from(mtime)),
                size_bytes: Some(size),
                format,
            });

            self.cached_hashes
                .lock()
                .expect("cached url lock poisoned")
                .insert(stem);
        }

        if !loaded.is_empty() {
            let mut guard = self.images.write().expect("disk cache lock poisoned");
            *guard = Arc::new(loaded.clone());
        }

        if removed > 0 {
            info!("removed {} corrupt cached images", removed);
        }
        info!("loaded {} cached images from disk", loaded.len());
        loaded
    }

    /// evict oldest files when the cache exceeds its size or count limits
    ///
    /// at least `min_keep` files survive; eviction stops once the cache is
    /// back under 80% of the size cap and under the file count cap. files
    /// with the temp prefix are never touched.
    pub fn cleanup(&self, min_keep: usize) {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total_size = 0u64;

        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !path.is_file() || name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total_size += meta.len();
                files.push((
                    path,
                    meta.len(),
                    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                ));
            }
        }

        let max_files = (min_keep * 2).max(MAX_CACHED_TO_LOAD);
        if total_size <= self.max_cache_bytes && files.len() <= max_files {
            return;
        }

        // oldest first; ties broken by filename
        files.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let max_removable = files.len().saturating_sub(min_keep);
        let size_floor = self.max_cache_bytes * 8 / 10;
        let mut removed_count = 0usize;
        let mut removed_size = 0u64;

        for (path, size, _) in files.iter().take(max_removable) {
            if total_size - removed_size <= size_floor
                && files.len() - removed_count <= max_files
            {
                break;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    removed_count += 1;
                    removed_size += size;
                }
                Err(e) => warn!("failed to remove {:?}: {}", path, e),
            }
        }

        if removed_count > 0 {
            info!(
                "evicted {} files ({:.1}MB), kept {}",
                removed_count,
                removed_size as f64 / 1024.0 / 1024.0,
                files.len() - removed_count
            );
        }
    }

    /// remove every cached file and reset the in-memory indexes
    ///
    /// irreversible; returns the number of files removed. idempotent on an
    /// already-empty cache.
    pub fn clear_all(&self) -> usize {
        let mut removed = 0usize;
        if let Ok(entries) = fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("clear_all failed to remove {:?}: {}", path, e),
                }
            }
        }

        *self.images.write().expect("disk cache lock poisoned") = Arc::new(Vec::new());
        self.cached_hashes
            .lock()
            .expect("cached url lock poisoned")
            .clear();
        debug!("disk cache cleared ({} files removed)", removed);
        removed
    }
}

/// content-addressed cache path for a url: `md5(url) + extension`
pub fn cache_path(cache_dir: &Path, image_url: &str) -> PathBuf {
    let hash = format!("{:x}", md5::compute(image_url.as_bytes()));
    let ext = url::Url::parse(image_url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        })
        .unwrap_or_else(|| ".jpg".to_string());
    cache_dir.join(format!("{hash}{ext}"))
}

/// quick validation via magic bytes
pub fn validate_image_header(path: &Path) -> bool {
    let Ok(bytes) = fs::read(path) else {
        return false;
    };
    header_is_image(&bytes)
}

/// whether a byte prefix matches a supported image container
pub fn header_is_image(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\xff\xd8")                      // JPEG
        || bytes.starts_with(b"\x89PNG\r\n\x1a\n")      // PNG
        || bytes.starts_with(b"RIFF")                   // WebP
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn write_file(dir: &Path, name: &str, header: &[u8], total_len: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(header).unwrap();
        file.write_all(&vec![0u8; total_len.saturating_sub(header.len())]).unwrap();
        path
    }

    fn cache_in(dir: &Path) -> DiskCache {
        DiskCache::new(Some(dir.to_path_buf()), DEFAULT_MAX_CACHE_MB).unwrap()
    }

    #[test]
    fn test_header_is_image() {
        assert!(header_is_image(b"\xff\xd8\xff\xe0rest"));
        assert!(header_is_image(PNG_MAGIC));
        assert!(header_is_image(b"RIFFxxxxWEBP"));
        assert!(header_is_image(b"GIF89a..."));
        assert!(!header_is_image(b"<html>not an image"));
        assert!(!header_is_image(b""));
    }

    #[test]
    fn test_cache_path_is_md5_plus_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());

        let url = "https://img.example.com/photos/sunset.PNG?sig=abc";
        let path = cache.cache_path_for(url);
        let expected = format!("{:x}.png", md5::compute(url.as_bytes()));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), expected);

        // no extension in the path falls back to .jpg
        let bare = cache.cache_path_for("https://img.example.com/raw");
        assert!(bare.to_string_lossy().ends_with(".jpg"));
    }

    #[test]
    fn test_load_from_disk_drops_invalid_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());

        write_file(tmp.path(), "good.png", PNG_MAGIC, 2048);
        write_file(tmp.path(), "tiny.png", PNG_MAGIC, 50);
        write_file(tmp.path(), "garbage.jpg", b"<html>", 2048);
        write_file(tmp.path(), "notes.txt", b"hello", 2048);

        let loaded = cache.load_from_disk();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].source_id, "cached");
        assert_eq!(loaded[0].source_kind, crate::models::SourceKind::Rss);
        assert!(loaded[0].fetched_at.is_some());

        // corrupt files were deleted, unrelated files survive
        assert!(!tmp.path().join("tiny.png").exists());
        assert!(!tmp.path().join("garbage.jpg").exists());
        assert!(tmp.path().join("notes.txt").exists());

        // idempotent: a second scan finds the same single image
        assert_eq!(cache.load_from_disk().len(), 1);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_add_and_existing_paths_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());

        let before = cache.images();
        let mut img = ImageRef::remote("feed", "a.jpg", "https://x.test/a.jpg".into());
        img.local_path = Some(tmp.path().join("a.jpg"));
        cache.add(img);

        // old snapshots are unaffected by the swap
        assert_eq!(before.len(), 0);
        assert_eq!(cache.count(), 1);
        assert!(cache.existing_paths().contains(&tmp.path().join("a.jpg")));
    }

    #[test]
    fn test_mark_and_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());

        assert!(!cache.is_cached("https://x.test/a.jpg"));
        cache.mark_cached("https://x.test/a.jpg");
        assert!(cache.is_cached("https://x.test/a.jpg"));
        assert!(!cache.is_cached("https://x.test/b.jpg"));
    }

    #[test]
    fn test_cleanup_respects_min_keep_and_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        // 1 MB cap so a handful of files overflow it
        let cache = DiskCache::new(Some(tmp.path().to_path_buf()), 1).unwrap();

        for i in 0..8 {
            let path = write_file(tmp.path(), &format!("img{i:02}.jpg"), b"\xff\xd8", 300 * 1024);
            // stagger mtimes so eviction order is deterministic
            let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(100 - i as u64);
            let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }
        write_file(tmp.path(), ".tmp.partial", b"\xff\xd8", 300 * 1024);

        cache.cleanup(4);

        let survivors: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        // temp file untouched, at least min_keep images survive
        assert!(survivors.contains(&".tmp.partial".to_string()));
        let image_count = survivors.iter().filter(|n| n.starts_with("img")).count();
        assert!(image_count >= 4, "kept {image_count}");
        assert!(image_count < 8, "evicted nothing");
        // newest files survive
        assert!(survivors.contains(&"img07.jpg".to_string()));
    }

    #[test]
    fn test_clear_all_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());

        write_file(tmp.path(), "a.png", PNG_MAGIC, 500);
        cache.load_from_disk();
        assert_eq!(cache.clear_all(), 1);
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.clear_all(), 0);
    }
}
