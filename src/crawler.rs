//! The external `Crawler` collaborator (§1, §6).
//!
//! The core never fetches a URL itself; it only calls through this trait.
//! `MockCrawler` is a scripted in-memory double used by the integration
//! tests in `tests/scenarios.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct WarmResult {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub cache_status: Option<String>,
    pub content_type: Option<String>,
    pub links: Vec<String>,
    pub redirect_url: Option<String>,
}

/// Error text drives retry/blocking classification (§4.3, §4.4.2); it is
/// deliberately a string rather than a typed enum, matching the upstream
/// contract which classifies by substring match on the error message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CrawlerError(pub String);

impl CrawlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[async_trait]
pub trait Crawler: Send + Sync {
    async fn warm_url(&self, url: &str, find_links: bool) -> Result<WarmResult, CrawlerError>;
    async fn discover_sitemaps(&self, domain: &str) -> Result<Vec<String>, CrawlerError>;
    async fn parse_sitemap(&self, sitemap_url: &str) -> Result<Vec<String>, CrawlerError>;
    fn filter_urls(&self, urls: Vec<String>, include_paths: &[String], exclude_paths: &[String]) -> Vec<String>;
    fn user_agent(&self) -> String;
}

/// Case-insensitive substring match per §4.3's rate-limit identification
/// rule, generalised from `FailureKind::classify` in the teacher crate.
#[must_use]
pub fn is_blocking_error(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    ["429", "too many requests", "rate limit", "403", "503"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// A scripted response queue keyed by URL, used by the S1-S7 scenarios.
pub struct MockCrawler {
    responses: Mutex<HashMap<String, Vec<Result<WarmResult, CrawlerError>>>>,
    sitemaps: Mutex<HashMap<String, Vec<String>>>,
    sitemap_urls: Mutex<HashMap<String, Vec<String>>>,
    call_counts: Mutex<HashMap<String, u32>>,
}

impl MockCrawler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            sitemaps: Mutex::new(HashMap::new()),
            sitemap_urls: Mutex::new(HashMap::new()),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one scripted response for `url`; responses are consumed FIFO.
    pub fn push_response(&self, url: impl Into<String>, response: Result<WarmResult, CrawlerError>) {
        self.responses
            .lock()
            .expect("mock crawler mutex poisoned")
            .entry(url.into())
            .or_default()
            .push(response);
    }

    pub fn set_sitemaps(&self, domain: impl Into<String>, sitemap_urls: Vec<String>) {
        self.sitemaps
            .lock()
            .expect("mock crawler mutex poisoned")
            .insert(domain.into(), sitemap_urls);
    }

    pub fn set_sitemap_urls(&self, sitemap_url: impl Into<String>, urls: Vec<String>) {
        self.sitemap_urls
            .lock()
            .expect("mock crawler mutex poisoned")
            .insert(sitemap_url.into(), urls);
    }

    #[must_use]
    pub fn call_count(&self, url: &str) -> u32 {
        self.call_counts
            .lock()
            .expect("mock crawler mutex poisoned")
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockCrawler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Crawler for MockCrawler {
    async fn warm_url(&self, url: &str, _find_links: bool) -> Result<WarmResult, CrawlerError> {
        *self
            .call_counts
            .lock()
            .expect("mock crawler mutex poisoned")
            .entry(url.to_string())
            .or_insert(0) += 1;

        let mut responses = self.responses.lock().expect("mock crawler mutex poisoned");
        match responses.get_mut(url).and_then(|queue| {
            if queue.len() > 1 {
                Some(queue.remove(0))
            } else {
                queue.first().map(clone_result)
            }
        }) {
            Some(result) => result,
            None => Err(CrawlerError::new(format!("no scripted response for {url}"))),
        }
    }

    async fn discover_sitemaps(&self, domain: &str) -> Result<Vec<String>, CrawlerError> {
        Ok(self
            .sitemaps
            .lock()
            .expect("mock crawler mutex poisoned")
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn parse_sitemap(&self, sitemap_url: &str) -> Result<Vec<String>, CrawlerError> {
        Ok(self
            .sitemap_urls
            .lock()
            .expect("mock crawler mutex poisoned")
            .get(sitemap_url)
            .cloned()
            .unwrap_or_default())
    }

    fn filter_urls(&self, urls: Vec<String>, include_paths: &[String], exclude_paths: &[String]) -> Vec<String> {
        urls.into_iter()
            .filter(|u| include_paths.is_empty() || include_paths.iter().any(|p| u.contains(p.as_str())))
            .filter(|u| !exclude_paths.iter().any(|p| u.contains(p.as_str())))
            .collect()
    }

    fn user_agent(&self) -> String {
        "crawl-scheduler-mock/1.0".to_string()
    }
}

fn clone_result(r: &Result<WarmResult, CrawlerError>) -> Result<WarmResult, CrawlerError> {
    match r {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(e.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_error_matches_known_markers() {
        assert!(is_blocking_error("429 too many requests"));
        assert!(is_blocking_error("HTTP 403 Forbidden"));
        assert!(is_blocking_error("503 Service Unavailable"));
        assert!(!is_blocking_error("connection timeout"));
    }
}
