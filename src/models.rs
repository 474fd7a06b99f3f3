//! shared data model for images flowing through the engine
use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
    url::Url,
};

/// where an image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// a local folder on disk
    Folder,

    /// a remote rss/json feed
    Rss,
}

/// the universal image descriptor
///
/// every image the engine touches is described by one of these, whether it
/// was scanned from a folder or downloaded from a feed. at least one of
/// `local_path` / `url` is always present; construction goes through
/// [`ImageRef::folder`] / [`ImageRef::remote`] which uphold that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    /// which pool this image belongs to
    pub source_kind: SourceKind,

    /// stable id of the origin (folder path or feed url)
    pub source_id: String,

    /// unique id within the source
    pub image_id: String,

    /// path on disk, present once cached or for folder images
    pub local_path: Option<PathBuf>,

    /// remote url, present for feed images
    pub url: Option<String>,

    /// entry title if the source supplied one
    pub title: Option<String>,

    /// entry description, truncated upstream
    pub description: Option<String>,

    /// entry author
    pub author: Option<String>,

    /// when the source says the image was created
    pub created_at: Option<DateTime<Utc>>,

    /// when the downloader fetched it (required for downloaded rss items)
    pub fetched_at: Option<DateTime<Utc>>,

    /// file size in bytes once on disk
    pub size_bytes: Option<u64>,

    /// file format (extension without the dot, uppercased)
    pub format: Option<String>,
}

impl ImageRef {
    /// make a descriptor for a local folder image
    pub fn folder(source_id: impl Into<String>, image_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            source_kind: SourceKind::Folder,
            source_id: source_id.into(),
            image_id: image_id.into(),
            local_path: Some(path),
            url: None,
            title: None,
            description: None,
            author: None,
            created_at: None,
            fetched_at: None,
            size_bytes: None,
            format: None,
        }
    }

    /// make a descriptor for a downloaded feed image
    pub fn remote(source_id: impl Into<String>, image_id: impl Into<String>, url: String) -> Self {
        Self {
            source_kind: SourceKind::Rss,
            source_id: source_id.into(),
            image_id: image_id.into(),
            local_path: None,
            url: Some(url),
            title: None,
            description: None,
            author: None,
            created_at: None,
            fetched_at: None,
            size_bytes: None,
            format: None,
        }
    }

    /// the dedupe key for this image: local path when present, else url
    pub fn key(&self) -> String {
        if let Some(p) = &self.local_path {
            return p.to_string_lossy().into_owned();
        }
        self.url.clone().unwrap_or_default()
    }

    /// host of the image url (or feed url) for domain diversity tracking
    pub fn domain(&self) -> String {
        for candidate in [self.url.as_deref(), Some(self.source_id.as_str())] {
            if let Some(raw) = candidate
                && let Ok(parsed) = Url::parse(raw)
                && let Some(host) = parsed.host_str()
            {
                return host.to_ascii_lowercase();
            }
        }
        "unknown".to_string()
    }

    /// whether the image bytes are available on disk
    pub fn is_local(&self) -> bool {
        self.local_path.as_deref().is_some_and(Path::exists)
    }

    /// a human readable name for logs
    pub fn display_name(&self) -> String {
        if let Some(t) = &self.title
            && !t.is_empty()
        {
            return t.clone();
        }
        if let Some(p) = &self.local_path
            && let Some(name) = p.file_name()
        {
            return name.to_string_lossy().into_owned();
        }
        if let Some(u) = &self.url {
            return u.rsplit('/').next().unwrap_or(u).to_string();
        }
        self.image_id.clone()
    }
}

/// normalised feed entry ready for download, produced by the parser
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    /// url of the image to download
    pub image_url: String,

    /// entry title
    pub title: String,

    /// entry description, truncated to 500 chars
    pub description: String,

    /// entry author (falls back to the feed title for rss feeds)
    pub author: String,

    /// publication time if the feed supplied a parseable one
    pub created_at: Option<DateTime<Utc>>,

    /// the feed url this entry came from
    pub source_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefers_local_path() {
        let mut r = ImageRef::remote("feed", "a.jpg", "https://x.test/a.jpg".into());
        assert_eq!(r.key(), "https://x.test/a.jpg");
        r.local_path = Some(PathBuf::from("/tmp/a.jpg"));
        assert_eq!(r.key(), "/tmp/a.jpg");
    }

    #[test]
    fn test_domain_from_url_then_source_id() {
        let r = ImageRef::remote(
            "https://feed.example.org/rss",
            "a.jpg",
            "https://IMG.Example.com/a.jpg".into(),
        );
        assert_eq!(r.domain(), "img.example.com");

        let mut r = ImageRef::remote("https://feed.example.org/rss", "b.jpg", String::new());
        r.url = None;
        r.local_path = Some(PathBuf::from("/tmp/b.jpg"));
        assert_eq!(r.domain(), "feed.example.org");
    }

    #[test]
    fn test_domain_unknown_when_unparseable() {
        let r = ImageRef::folder("shots", "b.png", PathBuf::from("/tmp/b.png"));
        assert_eq!(r.domain(), "unknown");
    }
}
