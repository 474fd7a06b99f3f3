//! network side of the feed pipeline
use {
    crate::{
        engine::state::ShutdownFlag,
        error::Result,
        rss::{
            cache::{TEMP_PREFIX, cache_path, validate_image_header},
            ratelimit::{RateLimiter, host_of},
        },
        settings::HttpConfig,
    },
    futures_util::StreamExt,
    reqwest::{Client, StatusCode, header::CONTENT_TYPE},
    std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio::io::AsyncWriteExt,
    tracing::{debug, info, warn},
};

/// pause applied to a domain that answered HTTP 429
const RATE_LIMITED_PAUSE: Duration = Duration::from_secs(120);

/// backoff before the single transient-error retry
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// longest slice slept while waiting on the limiter, so shutdown stays snappy
const GATE_SLICE: Duration = Duration::from_millis(500);

/// smallest file accepted after download
const MIN_IMAGE_BYTES: u64 = 100;

/// fetches feeds and images on behalf of the coordinator
///
/// every network call starts with a shutdown check and a rate-limit gate on
/// the target host. image downloads stream to a temp file, enforce a size
/// ceiling, and only reach their final content-addressed name after header
/// validation.
pub struct Downloader {
    client: Client,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownFlag,
    max_image_bytes: u64,
}

impl Downloader {
    /// build the shared HTTP client from settings
    ///
    /// # Errors
    ///
    /// returns an error if the client cannot be constructed
    pub fn new(http: &HttpConfig, limiter: Arc<RateLimiter>, shutdown: ShutdownFlag) -> Result<Self> {
        let client = Client::builder()
            .user_agent(http.user_agent.clone().unwrap_or_else(|| crate::USER_AGENT.to_string()))
            .timeout(Duration::from_secs(http.timeout_secs))
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .pool_max_idle_per_host(http.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(http.pool_idle_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            limiter,
            shutdown,
            max_image_bytes: http.max_image_bytes,
        })
    }

    /// fetch and parse an rss/atom feed
    ///
    /// # Errors
    ///
    /// returns an error on shutdown, network failure, or a malformed feed
    pub async fn fetch_feed(&self, url: &str) -> Result<feed_rs::model::Feed> {
        let response = self.get_checked(url).await?;
        let bytes = response.bytes().await?;
        Ok(feed_rs::parser::parse(bytes.as_ref())?)
    }

    /// fetch a json feed body
    ///
    /// # Errors
    ///
    /// returns an error on shutdown, network failure, or invalid json
    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.get_checked(url).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// download an image into the cache directory
    ///
    /// returns the final path on success, `None` on any failure. failures
    /// are logged here; reporting them to feed health is the coordinator's
    /// call.
    pub async fn download_image(&self, url: &str, cache_dir: &Path) -> Option<PathBuf> {
        let response = match self.get_checked(url).await {
            Ok(r) => r,
            Err(e) => {
                debug!("image request failed for {}: {}", url, e);
                return None;
            }
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            warn!("{} served {:?}, not an image", url, content_type);
            return None;
        }

        let final_path = cache_path(cache_dir, url);
        let file_name = final_path.file_name()?.to_string_lossy().into_owned();
        let temp_path = cache_dir.join(format!("{TEMP_PREFIX}{file_name}"));

        if let Err(e) = self.stream_to_file(response, &temp_path).await {
            debug!("image stream aborted for {}: {}", url, e);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return None;
        }

        let size = tokio::fs::metadata(&temp_path).await.map(|m| m.len()).unwrap_or(0);
        if size < MIN_IMAGE_BYTES || !validate_image_header(&temp_path) {
            warn!("discarding corrupt download from {}", url);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return None;
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            warn!("failed to finalise {}: {}", url, e);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return None;
        }

        debug!("downloaded {} ({} bytes)", url, size);
        Some(final_path)
    }

    /// mirror a cached file into the user's save directory, best effort
    pub async fn save_copy(&self, cached_path: &Path, save_dir: &Path) {
        let Some(name) = cached_path.file_name() else {
            return;
        };
        let dest = save_dir.join(name);
        if dest.exists() {
            return;
        }
        match tokio::fs::copy(cached_path, &dest).await {
            Ok(_) => info!("saved a copy to {:?}", dest),
            Err(e) => warn!("save-to-disk copy failed: {}", e),
        }
    }

    async fn stream_to_file(&self, response: reqwest::Response, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            if self.shutdown.is_set() {
                crate::bail!("shutdown requested mid-download");
            }
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_image_bytes {
                crate::bail!("image exceeds the {} byte ceiling", self.max_image_bytes);
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(())
    }

    /// shutdown check, rate-limit gate, request, retry, and status handling
    async fn get_checked(&self, url: &str) -> Result<reqwest::Response> {
        let host = host_of(url);
        self.gate(&host).await?;

        let mut response = self.client.get(url).send().await;
        if response.is_err() {
            // one retry on transient network errors
            tokio::time::sleep(RETRY_BACKOFF).await;
            if self.shutdown.is_set() {
                crate::bail!("shutdown requested");
            }
            response = self.client.get(url).send().await;
        }
        let response = response?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            info!("{} rate limited us, pausing for {:?}", host, RATE_LIMITED_PAUSE);
            self.limiter.pause_domain(&host, RATE_LIMITED_PAUSE).await;
            crate::bail!("HTTP 429 from {}", host);
        }
        if !status.is_success() {
            crate::bail!("HTTP {} from {}", status, url);
        }
        Ok(response)
    }

    /// wait for a rate-limit slot without sleeping through a shutdown
    async fn gate(&self, host: &str) -> Result<()> {
        loop {
            if self.shutdown.is_set() {
                crate::bail!("shutdown requested");
            }
            match self.limiter.try_acquire(host).await {
                None => return Ok(()),
                Some(delay) => tokio::time::sleep(delay.min(GATE_SLICE)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_gates_requests() {
        let shutdown = ShutdownFlag::new();
        shutdown.set();
        let downloader = Downloader::new(
            &HttpConfig::default(),
            Arc::new(RateLimiter::new()),
            shutdown,
        )
        .unwrap();

        // no request is issued: the gate bails before touching the network
        assert!(downloader.fetch_json("https://127.0.0.1:9/feed.json").await.is_err());
        assert!(
            downloader
                .download_image("https://127.0.0.1:9/a.jpg", Path::new("/tmp"))
                .await
                .is_none()
        );
    }
}
