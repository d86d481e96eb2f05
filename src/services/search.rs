//! Search Adapter - query string to opaque evidence blob
//!
//! Issues a Baidu web search and summarizes the returned page into a
//! short textual evidence blob (query, derived indicators, content
//! length, response time). The caller never parses result lists.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::{Duration, Instant};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Minimum page size that counts as a useful result
const MIN_CONTENT_LENGTH: usize = 10_000;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

static AUTHORITY_INDICATORS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["官方", "政府", "央行", "证监会", "财政部", "权威", "新华", "人民日报"]);

static FRESHNESS_INDICATORS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["最新", "今日", "近期", "刚刚", "2024", "2025", "2026"]);

/// Seam for the external web-search backend
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Returns (evidence text, ok). `ok` is true iff the page carried
    /// enough content and no transport error occurred. `max_results` is
    /// clamped into [2, 4].
    async fn search(&self, query: &str, max_results: usize) -> (String, bool);
}

/// Baidu web-search client
pub struct BaiduSearchClient {
    http_client: Client,
}

impl Default for BaiduSearchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BaiduSearchClient {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create search HTTP client");
        Self { http_client }
    }

    async fn fetch_page(&self, query: &str, max_results: usize) -> Result<(String, f64), String> {
        let start = Instant::now();
        let rn = max_results.to_string();

        // Freshness parameters keep results inside the last half year
        let response = self
            .http_client
            .get("https://www.baidu.com/s")
            .query(&[
                ("wd", query),
                ("pn", "0"),
                ("rn", rn.as_str()),
                ("ie", "utf-8"),
                ("qdr", "6m"),
                ("tbs", "qdr:6m"),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok((body, start.elapsed().as_secs_f64()))
    }
}

#[async_trait]
impl WebSearch for BaiduSearchClient {
    async fn search(&self, query: &str, max_results: usize) -> (String, bool) {
        let max_results = max_results.clamp(2, 4);
        tracing::info!("Baidu search: '{}' (max_results={})", query, max_results);

        match self.fetch_page(query, max_results).await {
            Ok((body, elapsed)) => {
                let summary = summarize_page(query, &body, elapsed);
                let ok = body.len() >= MIN_CONTENT_LENGTH;
                if ok {
                    tracing::info!("Search succeeded: '{}' ({} bytes)", query, body.len());
                } else {
                    tracing::warn!("Search content too short: '{}' ({} bytes)", query, body.len());
                }
                (summary, ok)
            },
            Err(e) => {
                tracing::warn!("Search failed: '{}': {}", query, e);
                (format!("搜索关键词'{}'未获取到有效结果: {}", query, e), false)
            },
        }
    }
}

/// Condense the raw page into the evidence blob handed to the deep
/// analyzer. The blob is opaque to the caller; only length and keyword
/// indicators are derived here.
fn summarize_page(query: &str, body: &str, elapsed_secs: f64) -> String {
    let authority_hits: Vec<&str> = AUTHORITY_INDICATORS
        .iter()
        .filter(|kw| body.contains(**kw))
        .copied()
        .collect();
    let freshness_hits: Vec<&str> = FRESHNESS_INDICATORS
        .iter()
        .filter(|kw| body.contains(**kw))
        .copied()
        .collect();

    let search_url = format!("https://www.baidu.com/s?wd={}", urlencoding::encode(query));

    format!(
        "百度搜索: {query}\n搜索链接: {url}\n内容长度: {len}\n权威指标: {authority}\n时效指标: {freshness}\n响应时间: {elapsed:.2}秒",
        query = query,
        url = search_url,
        len = body.len(),
        authority = if authority_hits.is_empty() { "无".to_string() } else { authority_hits.join("、") },
        freshness = if freshness_hits.is_empty() { "无".to_string() } else { freshness_hits.join("、") },
        elapsed = elapsed_secs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_carries_query_and_indicators() {
        let body = format!("{}央行 最新 消息{}", "x".repeat(100), "y".repeat(100));
        let summary = summarize_page("降准 影响", &body, 0.42);
        assert!(summary.contains("降准 影响"));
        assert!(summary.contains("央行"));
        assert!(summary.contains("最新"));
        assert!(summary.contains("响应时间"));
        assert!(summary.contains(&format!("内容长度: {}", body.len())));
    }

    #[test]
    fn query_is_url_encoded_in_summary() {
        let summary = summarize_page("A股 行情", "short", 0.1);
        assert!(summary.contains("wd=A%E8%82%A1%20%E8%A1%8C%E6%83%85"));
    }
}
