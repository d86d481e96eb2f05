//! Feed Ingestor - fetch one RSS feed and normalize entries
//!
//! Network and parse errors never reach the orchestrator: they produce
//! an empty list and a logged warning. Deduplication is the caller's
//! concern.

use chrono::Utc;
use feed_rs::model::{Entry, Feed};
use reqwest::Client;
use std::time::Duration;

use crate::config::RssFeedConfig;
use crate::models::NewsItem;
use crate::utils::clean_html;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_CATEGORY: &str = "finance";

/// RSS/Atom feed ingestor
pub struct FeedIngestor {
    http_client: Client,
}

impl Default for FeedIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedIngestor {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create feed HTTP client");
        Self { http_client }
    }

    /// Fetch one feed and normalize up to `max_items` entries.
    /// Failures yield an empty list, never an error.
    pub async fn fetch(&self, feed: &RssFeedConfig) -> Vec<NewsItem> {
        tracing::info!("Fetching RSS feed '{}': {}", feed.name, feed.url);

        let bytes = match self.fetch_bytes(&feed.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Feed fetch failed for '{}': {}", feed.name, e);
                return Vec::new();
            },
        };

        let parsed: Feed = match feed_rs::parser::parse(&bytes[..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Feed parse failed for '{}': {}", feed.name, e);
                return Vec::new();
            },
        };

        let total = parsed.entries.len();
        let items: Vec<NewsItem> = parsed
            .entries
            .into_iter()
            .take(feed.max_items)
            .filter_map(|entry| normalize_entry(entry, &feed.name))
            .collect();

        tracing::info!("Feed '{}': {} entries, {} normalized", feed.name, total, items.len());
        items
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .http_client
            .get(url)
            .header("Accept", "application/rss+xml, application/xml, text/xml")
            .header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Map one feed entry into a NewsItem; entries without a title or link
/// are dropped.
fn normalize_entry(entry: Entry, source: &str) -> Option<NewsItem> {
    let title = entry
        .title
        .as_ref()
        .map(|t| clean_html(&t.content))
        .filter(|t| !t.is_empty())?;

    // Prefer an external link; fall back to the entry id
    let url = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().unwrap_or("") != "self")
        .map(|l| l.href.clone())
        .unwrap_or_else(|| entry.id.clone());
    if url.is_empty() {
        return None;
    }

    // Summary, then first content body, then the title itself
    let mut content = entry
        .summary
        .as_ref()
        .map(|s| clean_html(&s.content))
        .unwrap_or_default();
    if content.is_empty() {
        if let Some(body) = entry.content.as_ref().and_then(|c| c.body.as_ref()) {
            content = clean_html(body);
        }
    }
    if content.is_empty() {
        content = title.clone();
    }

    // Event time: published, then updated, then ingest time
    let publish_time = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let keywords: Vec<String> = entry
        .categories
        .iter()
        .map(|c| c.term.trim().to_string())
        .filter(|term| !term.is_empty())
        .collect();

    let mut item = NewsItem::new(title, content, source.to_string(), url);
    item.category = DEFAULT_CATEGORY.to_string();
    item.publish_time = publish_time;
    item.keywords = keywords;
    Some(item)
}

// ============================================================================
// Multi-feed collector
// ============================================================================

/// Seam between the orchestrator and the feed network
#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    /// Fetch everything currently visible. The caller dedupes against
    /// the store.
    async fn collect_all(&self) -> Vec<NewsItem>;
}

/// Runs every enabled feed through the ingestor
pub struct NewsCollector {
    ingestor: FeedIngestor,
    feeds: Vec<RssFeedConfig>,
}

impl NewsCollector {
    pub fn new(feeds: Vec<RssFeedConfig>) -> Self {
        Self { ingestor: FeedIngestor::new(), feeds }
    }
}

#[async_trait::async_trait]
impl NewsSource for NewsCollector {
    async fn collect_all(&self) -> Vec<NewsItem> {
        let mut all = Vec::new();
        for feed in self.feeds.iter().filter(|f| f.enabled) {
            let items = self.ingestor.fetch(feed).await;
            all.extend(items);
        }
        tracing::info!("Collected {} items across {} feeds", all.len(), self.feeds.len());
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>中国新闻网-财经</title>
    <item>
      <title>央行宣布降准0.5个百分点</title>
      <link>https://www.chinanews.com.cn/fortune/2025/08-01/1.shtml</link>
      <description>&lt;p&gt;中国人民银行决定下调金融机构存款准备金率&lt;/p&gt;</description>
      <pubDate>Fri, 01 Aug 2025 08:30:00 +0800</pubDate>
      <category>货币政策</category>
    </item>
    <item>
      <title>A股三大指数集体高开</title>
      <link>https://www.chinanews.com.cn/fortune/2025/08-01/2.shtml</link>
      <description>沪指涨0.8%，创业板指涨1.2%</description>
    </item>
    <item>
      <title></title>
      <link>https://www.chinanews.com.cn/fortune/2025/08-01/3.shtml</link>
    </item>
  </channel>
</rss>"#;

    fn parse_sample(max_items: usize) -> Vec<NewsItem> {
        let feed = feed_rs::parser::parse(SAMPLE_RSS.as_bytes()).unwrap();
        feed.entries
            .into_iter()
            .take(max_items)
            .filter_map(|entry| normalize_entry(entry, "ChinaNews"))
            .collect()
    }

    #[test]
    fn entries_normalize_with_html_stripped() {
        let items = parse_sample(50);
        // The titleless entry is dropped
        assert_eq!(items.len(), 2);

        let first = &items[0];
        assert_eq!(first.title, "央行宣布降准0.5个百分点");
        assert_eq!(first.source, "ChinaNews");
        assert_eq!(first.category, "finance");
        assert_eq!(first.content, "中国人民银行决定下调金融机构存款准备金率");
        assert_eq!(first.keywords, vec!["货币政策".to_string()]);
        assert_eq!(first.importance_score, 0);
    }

    #[test]
    fn publish_time_parses_or_defaults() {
        let items = parse_sample(50);
        // 08:30 +0800 is 00:30 UTC
        assert_eq!(items[0].publish_time.to_rfc3339(), "2025-08-01T00:30:00+00:00");
        // The undated entry fell back to ingest time
        assert!(Utc::now().signed_duration_since(items[1].publish_time).num_seconds() < 60);
    }

    #[test]
    fn max_items_caps_the_batch() {
        let items = parse_sample(1);
        assert_eq!(items.len(), 1);
    }
}
