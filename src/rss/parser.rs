//! feed mode detection and entry parsing, independent of any I/O
use {
    crate::models::ParsedEntry,
    chrono::{DateTime, Utc},
    feed_rs::model::{Entry, Feed},
    regex::Regex,
    serde_json::Value,
    std::sync::LazyLock,
    tracing::{debug, info, warn},
};

/// longest description carried through to the queue
const MAX_DESCRIPTION_CHARS: usize = 500;

/// minimum source width accepted for reddit posts that carry preview metadata
const REDDIT_MIN_WIDTH: u64 = 2560;

/// image extensions accepted from reddit post urls
const REDDIT_IMAGE_EXTS: [&str; 4] = [".jpg", ".jpeg", ".png", ".webp"];

static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<img[^>]+src=["']([^"']+)["']"#).expect("img tag regex is valid")
});

/// how a configured feed url should be fetched and parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// rss or atom xml
    Rss,

    /// flickr-style or reddit-style json
    Json,
}

/// determine whether a url should be fetched as rss or json
///
/// rules, applied in order: a `format=json` query selects json, a `.json`
/// path selects json, a reddit `.rss` path is rewritten to `.json`, and
/// everything else stays rss.
///
/// # Returns
///
/// `(request_url, mode, original_url)`
pub fn resolve_feed_mode(feed_url: &str) -> (String, FeedMode, String) {
    let parsed = url::Url::parse(feed_url)
        .or_else(|_| url::Url::parse(&format!("https://{feed_url}")))
        .ok();

    let Some(mut parsed) = parsed else {
        return (feed_url.to_string(), FeedMode::Rss, feed_url.to_string());
    };
    parsed.set_fragment(None);

    let path = parsed.path().to_ascii_lowercase();
    let query = parsed.query().unwrap_or_default().to_ascii_lowercase();
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    if query.contains("format=json") || path.ends_with(".json") {
        return (parsed.to_string(), FeedMode::Json, feed_url.to_string());
    }

    if host.contains("reddit.com") && path.ends_with(".rss") {
        let json_path = format!("{}.json", path.trim_end_matches(".rss"));
        parsed.set_path(&json_path);
        return (parsed.to_string(), FeedMode::Json, feed_url.to_string());
    }

    (parsed.to_string(), FeedMode::Rss, feed_url.to_string())
}

/// parse an rss/atom feed into normalised entries
///
/// entries without a discoverable image url are skipped; descriptions are
/// truncated to 500 chars; the feed title stands in for missing authors.
pub fn parse_rss(feed: &Feed, feed_url: &str, max_entries: usize) -> Vec<ParsedEntry> {
    let feed_title = feed
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "Unknown Feed".to_string());

    let mut entries = Vec::new();
    for entry in &feed.entries {
        if entries.len() >= max_entries {
            break;
        }
        let Some(image_url) = extract_image_from_entry(entry) else {
            continue;
        };

        let summary = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .unwrap_or_default();
        entries.push(ParsedEntry {
            image_url,
            title: entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_else(|| "Untitled".to_string()),
            description: truncate_chars(&summary, MAX_DESCRIPTION_CHARS),
            author: entry
                .authors
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| feed_title.clone()),
            created_at: entry.published.or(entry.updated),
            source_url: feed_url.to_string(),
        });
    }

    info!(
        "feed '{}': {} entries, {} with images",
        feed_title,
        feed.entries.len(),
        entries.len()
    );
    entries
}

/// parse a json feed response (flickr or reddit shape)
///
/// unknown shapes are logged and produce an empty list, never an error.
pub fn parse_json(data: &Value, original_url: &str, max_entries: usize) -> Vec<ParsedEntry> {
    let Some(obj) = data.as_object() else {
        warn!("json feed data is not an object");
        return Vec::new();
    };

    if obj.get("kind").and_then(Value::as_str) == Some("Listing") {
        let posts: Vec<&Value> = obj
            .get("data")
            .and_then(|d| d.get("children"))
            .and_then(Value::as_array)
            .map(|children| children.iter().filter_map(|c| c.get("data")).collect())
            .unwrap_or_default();
        return parse_reddit_entries(&posts, original_url, max_entries);
    }

    if let Some(items) = obj.get("items").and_then(Value::as_array) {
        return parse_flickr_entries(items, original_url, max_entries);
    }

    warn!("unrecognised json feed structure from {}", original_url);
    Vec::new()
}

fn parse_flickr_entries(items: &[Value], feed_url: &str, limit: usize) -> Vec<ParsedEntry> {
    let mut entries = Vec::new();
    for item in items {
        if entries.len() >= limit {
            break;
        }
        let Some(raw_url) = item
            .get("media")
            .and_then(|m| m.get("m"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        // upgrade _m (medium) to _b (large)
        let image_url = if raw_url.contains("_m.jpg") {
            raw_url.replace("_m.jpg", "_b.jpg")
        } else if raw_url.contains("_m.png") {
            raw_url.replace("_m.png", "_b.png")
        } else {
            raw_url.to_string()
        };

        let created_at = item
            .get("published")
            .and_then(Value::as_str)
            .and_then(parse_rfc_timestamp);

        entries.push(ParsedEntry {
            image_url,
            title: string_or(item, "title", "Untitled"),
            description: truncate_chars(
                item.get("description").and_then(Value::as_str).unwrap_or(""),
                MAX_DESCRIPTION_CHARS,
            ),
            author: string_or(item, "author", ""),
            created_at,
            source_url: feed_url.to_string(),
        });
    }

    info!("flickr json: {} items, {} with images", items.len(), entries.len());
    entries
}

fn parse_reddit_entries(posts: &[&Value], feed_url: &str, limit: usize) -> Vec<ParsedEntry> {
    let mut entries = Vec::new();
    for post in posts {
        if entries.len() >= limit {
            break;
        }
        let Some(image_url) = post
            .get("url_overridden_by_dest")
            .and_then(Value::as_str)
            .or_else(|| post.get("url").and_then(Value::as_str))
        else {
            continue;
        };

        if !reddit_url_is_image(image_url) {
            continue;
        }

        // prefer high-res posts when the preview metadata exposes a width
        if let Some(width) = post
            .get("preview")
            .and_then(|p| p.get("images"))
            .and_then(Value::as_array)
            .and_then(|imgs| imgs.first())
            .and_then(|img| img.get("source"))
            .and_then(|src| src.get("width"))
            .and_then(Value::as_u64)
            && width < REDDIT_MIN_WIDTH
        {
            debug!("skipping low-res reddit post ({}px wide)", width);
            continue;
        }

        let created_at = post
            .get("created_utc")
            .and_then(Value::as_f64)
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0));

        entries.push(ParsedEntry {
            image_url: image_url.to_string(),
            title: string_or(post, "title", "Untitled"),
            description: truncate_chars(
                post.get("selftext").and_then(Value::as_str).unwrap_or(""),
                MAX_DESCRIPTION_CHARS,
            ),
            author: string_or(post, "author", ""),
            created_at,
            source_url: feed_url.to_string(),
        });
    }

    info!("reddit json: {} posts, {} with images", posts.len(), entries.len());
    entries
}

/// extract the best image url from a feed entry
///
/// priority: media content, enclosure links, an `<img>` embedded in the
/// content or summary, then media thumbnails.
fn extract_image_from_entry(entry: &Entry) -> Option<String> {
    for media in &entry.media {
        for content in &media.content {
            let is_image = content
                .content_type
                .as_ref()
                .map(|ct| ct.to_string().starts_with("image"))
                .unwrap_or_else(|| {
                    content
                        .url
                        .as_ref()
                        .is_some_and(|u| url_has_image_ext(u.path()))
                });
            if is_image && let Some(u) = &content.url {
                return Some(u.to_string());
            }
        }
    }

    for link in &entry.links {
        if link.rel.as_deref() == Some("enclosure")
            && link
                .media_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image"))
        {
            return Some(link.href.clone());
        }
    }

    let body = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
        .unwrap_or_default();
    if let Some(captures) = IMG_TAG_RE.captures(&body) {
        return Some(captures[1].to_string());
    }

    for media in &entry.media {
        if let Some(thumb) = media.thumbnails.first() {
            return Some(thumb.image.uri.clone());
        }
    }

    None
}

fn reddit_url_is_image(raw: &str) -> bool {
    let path = url::Url::parse(raw)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| raw.to_ascii_lowercase());
    REDDIT_IMAGE_EXTS.iter().any(|ext| path.ends_with(ext))
}

fn url_has_image_ext(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    [".jpg", ".jpeg", ".png", ".webp", ".gif"]
        .iter()
        .any(|ext| lowered.ends_with(ext))
}

fn parse_rfc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn truncate_chars(raw: &str, max: usize) -> String {
    raw.chars().take(max).collect()
}

fn string_or(value: &Value, key: &str, fallback: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn test_resolve_feed_mode_query_format() {
        let (req, mode, orig) = resolve_feed_mode(
            "https://www.flickr.com/services/feeds/photos_public.gne?format=json&nojsoncallback=1",
        );
        assert_eq!(mode, FeedMode::Json);
        assert!(req.contains("format=json"));
        assert!(orig.starts_with("https://www.flickr.com"));
    }

    #[test]
    fn test_resolve_feed_mode_json_path() {
        let (_, mode, _) = resolve_feed_mode("https://example.com/feeds/daily.json");
        assert_eq!(mode, FeedMode::Json);
    }

    #[test]
    fn test_resolve_feed_mode_reddit_rss_rewrite() {
        let (req, mode, orig) = resolve_feed_mode("https://www.reddit.com/r/EarthPorn/top.rss?t=week");
        assert_eq!(mode, FeedMode::Json);
        assert!(req.contains("/r/earthporn/top.json"));
        assert!(orig.ends_with("top.rss?t=week"));
    }

    #[test]
    fn test_resolve_feed_mode_default_rss() {
        let (_, mode, _) = resolve_feed_mode("https://www.nasa.gov/feeds/iotd-feed");
        assert_eq!(mode, FeedMode::Rss);
    }

    #[test]
    fn test_resolve_feed_mode_bare_host() {
        let (req, mode, _) = resolve_feed_mode("example.com/feed");
        assert_eq!(mode, FeedMode::Rss);
        assert!(req.starts_with("https://example.com/"));
    }

    #[test]
    fn test_parse_json_flickr_upgrades_size() {
        let data = json!({
            "items": [
                {
                    "title": "Sunrise",
                    "media": {"m": "https://live.staticflickr.com/1/2_m.jpg"},
                    "description": "d",
                    "author": "someone",
                    "published": "2024-05-01T06:00:00Z"
                },
                {"title": "no media"}
            ]
        });
        let entries = parse_json(&data, "https://flickr.example/feed", 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image_url, "https://live.staticflickr.com/1/2_b.jpg");
        assert_eq!(entries[0].author, "someone");
        assert!(entries[0].created_at.is_some());
    }

    #[test]
    fn test_parse_json_reddit_filters_ext_and_width() {
        let data = json!({
            "kind": "Listing",
            "data": {"children": [
                {"data": {
                    "title": "gallery link",
                    "url": "https://www.reddit.com/gallery/abc"
                }},
                {"data": {
                    "title": "too small",
                    "url": "https://i.redd.it/small.jpg",
                    "preview": {"images": [{"source": {"width": 1920}}]}
                }},
                {"data": {
                    "title": "keeper",
                    "url": "https://i.redd.it/big.png",
                    "preview": {"images": [{"source": {"width": 3840}}]},
                    "created_utc": 1714550400.0
                }},
                {"data": {
                    "title": "no preview metadata",
                    "url": "https://i.redd.it/other.webp"
                }}
            ]}
        });
        let entries = parse_json(&data, "https://www.reddit.com/r/x/top.rss", 10);
        let urls: Vec<_> = entries.iter().map(|e| e.image_url.as_str()).collect();
        assert_eq!(urls, vec!["https://i.redd.it/big.png", "https://i.redd.it/other.webp"]);
        assert!(entries[0].created_at.is_some());
    }

    #[test]
    fn test_parse_json_unknown_shape_is_empty() {
        assert!(parse_json(&json!({"foo": 1}), "u", 10).is_empty());
        assert!(parse_json(&json!([1, 2, 3]), "u", 10).is_empty());
    }

    #[test]
    fn test_parse_rss_extracts_media_and_truncates() {
        let long_summary = "x".repeat(800);
        let xml = format!(
            r#"<?xml version="1.0"?>
            <rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
              <channel>
                <title>Daily Pictures</title>
                <item>
                  <title>One</title>
                  <description>{long_summary}</description>
                  <media:content url="https://img.example.com/one.jpg" type="image/jpeg"/>
                </item>
                <item>
                  <title>No image here</title>
                  <description>plain text only</description>
                </item>
                <item>
                  <title>Embedded</title>
                  <description>&lt;img src="https://img.example.com/two.png"&gt;</description>
                </item>
              </channel>
            </rss>"#
        );
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        let entries = parse_rss(&feed, "https://feed.example.com/rss", 10);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image_url, "https://img.example.com/one.jpg");
        assert_eq!(entries[0].description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert_eq!(entries[1].image_url, "https://img.example.com/two.png");
        // missing author falls back to the feed title
        assert_eq!(entries[0].author, "Daily Pictures");
    }

    #[test]
    fn test_parse_rss_respects_max_entries() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
              <channel><title>F</title>
                <item><title>a</title><media:content url="https://x.test/a.jpg" type="image/jpeg"/></item>
                <item><title>b</title><media:content url="https://x.test/b.jpg" type="image/jpeg"/></item>
                <item><title>c</title><media:content url="https://x.test/c.jpg" type="image/jpeg"/></item>
              </channel>
            </rss>"#;
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        assert_eq!(parse_rss(&feed, "u", 2).len(), 2);
    }
}
