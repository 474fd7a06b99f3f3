//! folder scanning source
use {
    crate::models::ImageRef,
    chrono::{DateTime, Utc},
    jwalk::WalkDir,
    std::path::{Path, PathBuf},
    tracing::{debug, info, warn},
};

/// file extensions treated as images
pub const SUPPORTED_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff", "ico", "jfif",
];

/// scans a local folder for images
pub struct FolderSource {
    folder_path: PathBuf,
    recursive: bool,
    source_id: String,
}

impl FolderSource {
    /// make a source for `folder_path`
    pub fn new(folder_path: PathBuf, recursive: bool) -> Self {
        let source_id = folder_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder_path.to_string_lossy().into_owned());
        Self {
            folder_path,
            recursive,
            source_id,
        }
    }

    /// the folder being scanned
    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    /// whether the folder exists and is a readable directory
    pub fn is_available(&self) -> bool {
        self.folder_path.is_dir()
    }

    /// scan the folder and return every image found
    ///
    /// unavailable folders return an empty list; unreadable files are
    /// skipped with a warning.
    pub fn scan(&self) -> Vec<ImageRef> {
        if !self.is_available() {
            warn!("folder not available: {:?}", self.folder_path);
            return Vec::new();
        }

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut images = Vec::new();
        let mut scanned = 0usize;

        for entry in WalkDir::new(&self.folder_path).max_depth(max_depth).skip_hidden(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("error scanning {:?}: {}", self.folder_path, e);
                    continue;
                }
            };
            if !entry.file_type.is_file() {
                continue;
            }
            scanned += 1;

            let path = entry.path();
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());
            let Some(ext) = ext else { continue };
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }

            let image_id = path
                .strip_prefix(&self.folder_path)
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| path.to_string_lossy().into_owned());

            let mut image = ImageRef::folder(self.source_id.clone(), image_id, path.clone());
            image.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
            image.format = Some(ext);
            if let Ok(meta) = entry.metadata() {
                image.size_bytes = Some(meta.len());
                image.created_at = meta.created().ok().map(DateTime::<Utc>::from);
            }
            images.push(image);
        }

        info!(
            "scanned {:?}: {} images of {} files",
            self.folder_path,
            images.len(),
            scanned
        );
        debug!("source '{}' ready", self.source_id);
        images
    }
}

#[cfg(test)]
mod tests {
    use {super::*, image::DynamicImage};

    #[test]
    fn test_scan_finds_images_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("nested");
        std::fs::create_dir(&sub).unwrap();

        DynamicImage::new_rgb8(4, 4).save(tmp.path().join("top.png")).unwrap();
        DynamicImage::new_rgb8(4, 4).save(sub.join("deep.jpg")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not an image").unwrap();

        let source = FolderSource::new(tmp.path().to_path_buf(), true);
        let images = source.scan();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.source_kind == crate::models::SourceKind::Folder));
        assert!(images.iter().all(|i| i.is_local()));
        assert!(images.iter().all(|i| i.size_bytes.is_some()));
    }

    #[test]
    fn test_non_recursive_scan_skips_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        DynamicImage::new_rgb8(4, 4).save(tmp.path().join("top.png")).unwrap();
        DynamicImage::new_rgb8(4, 4).save(sub.join("deep.jpg")).unwrap();

        let source = FolderSource::new(tmp.path().to_path_buf(), false);
        assert_eq!(source.scan().len(), 1);
    }

    #[test]
    fn test_missing_folder_is_empty_not_fatal() {
        let source = FolderSource::new(PathBuf::from("/nonexistent/pictures"), true);
        assert!(!source.is_available());
        assert!(source.scan().is_empty());
    }
}
