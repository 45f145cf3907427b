use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, warn};

use crate::config::{Config, USER_AGENT};

/// Anchor hrefs in a NEMWEB directory index page.
static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href\s*=\s*"([^"]+)""#).unwrap());

/// HTTP failure taxonomy. Transient conditions (timeouts, 5xx, 429) are
/// retried internally and surface as `Unavailable` once retries are spent.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable after retries: {0}")]
    Unavailable(String),

    #[error("protocol error HTTP {status} for {url}")]
    Protocol { status: StatusCode, url: String },
}

impl FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }
}

/// Shared HTTP client for directory listings and artifact downloads.
pub struct Fetcher {
    client: Client,
    max_retries: usize,
    retry_delay: Duration,
    request_timeout: Duration,
    listing_timeout: Duration,
    archive_timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/zip, text/html"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            listing_timeout: Duration::from_secs(config.listing_timeout_seconds),
            archive_timeout: Duration::from_secs(config.archive_timeout_seconds),
        })
    }

    /// List a directory index, returning the basenames of all linked files.
    /// Ordering is whatever the server emitted; callers sort.
    pub async fn list(&self, url: &str) -> Result<Vec<String>, FetchError> {
        let body = self.get_with_timeout(url, self.listing_timeout).await?;
        let names = extract_basenames(&String::from_utf8_lossy(&body));
        debug!("listed {} entries from {}", names.len(), url);
        Ok(names)
    }

    /// Download an artifact body with the standard timeout.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_with_timeout(url, self.request_timeout).await
    }

    /// Download a large weekly/monthly archive with the extended timeout.
    pub async fn get_archive(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_with_timeout(url, self.archive_timeout).await
    }

    async fn get_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let strategy = FixedInterval::new(self.retry_delay).take(self.max_retries);
        RetryIf::spawn(
            strategy,
            || self.get_once(url, timeout),
            |e: &FetchError| {
                if e.is_transient() {
                    warn!("transient failure for {url}, retrying: {e}");
                    true
                } else {
                    false
                }
            },
        )
        .await
    }

    async fn get_once(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| FetchError::Unavailable(format!("{url}: {e}")))?;
            debug!("downloaded {} bytes from {}", bytes.len(), url);
            return Ok(bytes.to_vec());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Unavailable(format!("{url}: HTTP {status}")));
        }
        Err(FetchError::Protocol {
            status,
            url: url.to_string(),
        })
    }
}

/// Pull file basenames out of a directory-index page.
fn extract_basenames(html: &str) -> Vec<String> {
    let mut names = Vec::new();
    for cap in HREF_RE.captures_iter(html) {
        let href = cap[1].trim();
        if href.is_empty() || href.ends_with('/') || href.contains('?') {
            continue;
        }
        let base = href.rsplit('/').next().unwrap_or(href);
        if !base.is_empty() && base != ".." {
            names.push(base.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn href_extraction_returns_basenames() {
        let html = r#"
            <html><body>
            <a href="/Reports/Current/Dispatch_SCADA/PUBLIC_DISPATCHSCADA_202501011005_0000000123.zip">x</a>
            <a href="PUBLIC_DISPATCHSCADA_202501011010_0000000124.zip">y</a>
            <a href="../">parent</a>
            <a href="?C=M;O=A">sort</a>
            </body></html>
        "#;
        assert_eq!(
            extract_basenames(html),
            vec![
                "PUBLIC_DISPATCHSCADA_202501011005_0000000123.zip",
                "PUBLIC_DISPATCHSCADA_202501011010_0000000124.zip",
            ]
        );
    }

    #[test]
    fn absolute_and_relative_hrefs_resolve_to_the_same_name() {
        let html = r#"<a HREF="/Reports/Archive/X/PUBLIC_TRADINGIS_20250101_20250107.zip">"#;
        assert_eq!(
            extract_basenames(html),
            vec!["PUBLIC_TRADINGIS_20250101_20250107.zip"]
        );
    }
}
