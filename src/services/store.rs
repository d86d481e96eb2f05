//! News Store - single-writer persistent store for news and analyses
//!
//! Repository over the SQLite pool. Keywords and factors are serialized
//! as JSON text; decode failures yield empty lists rather than errors.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, Row, SqlitePool};
use std::collections::BTreeMap;

use crate::models::{AnalysisResult, ImpactDegree, NewsItem, clamp_score_f64, clamp_score_i32};

/// Store errors surface to the caller; batch paths log and continue on
/// per-row failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Query filter for [`NewsStore::query`]
#[derive(Debug, Clone, Default)]
pub struct NewsQuery {
    pub limit: i64,
    pub offset: i64,
    pub source: Option<String>,
    pub category: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl NewsQuery {
    pub fn latest(limit: i64) -> Self {
        Self { limit, ..Default::default() }
    }
}

/// Aggregated store counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub today: i64,
    pub by_source: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
}

// ============================================================================
// Row mapping
// ============================================================================

/// Raw row; timestamps and JSON-encoded lists are decoded leniently
#[derive(Debug, FromRow)]
struct NewsItemRow {
    id: String,
    title: String,
    content: Option<String>,
    source: Option<String>,
    publish_time: Option<String>,
    url: Option<String>,
    category: Option<String>,
    keywords: Option<String>,
    importance_score: i64,
    importance_reasoning: Option<String>,
    importance_factors: Option<String>,
    impact_degree: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

fn decode_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn decode_list(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

impl From<NewsItemRow> for NewsItem {
    fn from(row: NewsItemRow) -> Self {
        NewsItem {
            id: row.id,
            title: row.title,
            content: row.content.unwrap_or_default(),
            source: row.source.unwrap_or_default(),
            url: row.url.unwrap_or_default(),
            category: row.category.unwrap_or_default(),
            publish_time: decode_time(row.publish_time.as_deref()),
            keywords: decode_list(row.keywords.as_deref()),
            importance_score: clamp_score_i32(row.importance_score as i32),
            importance_reasoning: row.importance_reasoning.unwrap_or_default(),
            importance_factors: decode_list(row.importance_factors.as_deref()),
            impact_degree: ImpactDegree::parse_degree(row.impact_degree.as_deref().unwrap_or("")),
            created_at: decode_time(row.created_at.as_deref()),
            updated_at: decode_time(row.updated_at.as_deref()),
        }
    }
}

#[derive(Debug, FromRow)]
struct AnalysisResultRow {
    news_id: String,
    impact_score: f64,
    summary: Option<String>,
    analysis_time: Option<String>,
}

impl From<AnalysisResultRow> for AnalysisResult {
    fn from(row: AnalysisResultRow) -> Self {
        AnalysisResult {
            news_id: row.news_id,
            impact_score: clamp_score_f64(row.impact_score),
            summary: row.summary.unwrap_or_default(),
            impact_degree: ImpactDegree::Unknown,
            analysis_time: decode_time(row.analysis_time.as_deref()),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Repository for news items and impact analysis results
pub struct NewsStore {
    pool: SqlitePool,
}

impl NewsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get reference to pool (for testing)
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert one item. Assigns an id if empty; a fresh item whose
    /// (title, url) already exists is a no-op. Returns true if written.
    pub async fn save(&self, item: &mut NewsItem) -> StoreResult<bool> {
        if item.id.is_empty() {
            if self.exists(&item.title, &item.url).await? {
                tracing::debug!("Skipping duplicate news: {}", item.title);
                return Ok(false);
            }
            item.ensure_id();
        }

        item.updated_at = Utc::now();
        item.importance_score = clamp_score_i32(item.importance_score);

        let keywords = serde_json::to_string(&item.keywords).unwrap_or_else(|_| "[]".into());
        let factors =
            serde_json::to_string(&item.importance_factors).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            r#"INSERT OR REPLACE INTO news_items
               (id, title, content, source, publish_time, url, category, keywords,
                importance_score, importance_reasoning, importance_factors, impact_degree,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.source)
        .bind(item.publish_time.to_rfc3339())
        .bind(&item.url)
        .bind(&item.category)
        .bind(&keywords)
        .bind(item.importance_score)
        .bind(&item.importance_reasoning)
        .bind(&factors)
        .bind(item.impact_degree.as_str())
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Upsert a batch; per-row failures are logged and skipped.
    /// Returns the number of rows written.
    pub async fn save_batch(&self, items: &mut [NewsItem]) -> StoreResult<usize> {
        let mut saved = 0;
        for item in items.iter_mut() {
            match self.save(item).await {
                Ok(true) => saved += 1,
                Ok(false) => {},
                Err(e) => {
                    tracing::error!("Failed to save news item '{}': {}", item.title, e);
                },
            }
        }
        tracing::info!("Batch save complete: {}/{}", saved, items.len());
        Ok(saved)
    }

    /// Dedup probe: any row matching the title, or the url when non-empty
    pub async fn exists(&self, title: &str, url: &str) -> StoreResult<bool> {
        let row = if url.is_empty() {
            sqlx::query("SELECT 1 FROM news_items WHERE title = ? LIMIT 1")
                .bind(title)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT 1 FROM news_items WHERE title = ? OR url = ? LIMIT 1")
                .bind(title)
                .bind(url)
                .fetch_optional(&self.pool)
                .await?
        };
        Ok(row.is_some())
    }

    /// Newest-first listing with optional source/category/time filters
    pub async fn query(&self, q: &NewsQuery) -> StoreResult<Vec<NewsItem>> {
        let mut sql = String::from("SELECT * FROM news_items WHERE 1=1");
        if q.source.is_some() {
            sql.push_str(" AND source = ?");
        }
        if q.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if q.start_time.is_some() {
            sql.push_str(" AND publish_time >= ?");
        }
        if q.end_time.is_some() {
            sql.push_str(" AND publish_time <= ?");
        }
        sql.push_str(" ORDER BY publish_time DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, NewsItemRow>(&sql);
        if let Some(source) = &q.source {
            query = query.bind(source);
        }
        if let Some(category) = &q.category {
            query = query.bind(category);
        }
        if let Some(start) = &q.start_time {
            query = query.bind(start.to_rfc3339());
        }
        if let Some(end) = &q.end_time {
            query = query.bind(end.to_rfc3339());
        }
        let limit = if q.limit > 0 { q.limit } else { 100 };
        query = query.bind(limit).bind(q.offset);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(NewsItem::from).collect())
    }

    pub async fn by_id(&self, id: &str) -> StoreResult<Option<NewsItem>> {
        let row = sqlx::query_as::<_, NewsItemRow>("SELECT * FROM news_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(NewsItem::from))
    }

    /// Items within [start, end] ordered by importance desc, then newest
    pub async fn by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<NewsItem>> {
        let rows = sqlx::query_as::<_, NewsItemRow>(
            r#"SELECT * FROM news_items
               WHERE publish_time >= ? AND publish_time <= ?
               ORDER BY importance_score DESC, publish_time DESC"#,
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NewsItem::from).collect())
    }

    /// Purge items older than `days`, cascading to their analysis rows.
    /// Returns the number of news rows deleted.
    pub async fn delete_older_than(&self, days: i64) -> StoreResult<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"DELETE FROM analysis_results
               WHERE news_id IN (SELECT id FROM news_items WHERE publish_time < ?)"#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM news_items WHERE publish_time < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let deleted = result.rows_affected();
        tracing::info!("Purged {} news items older than {} days", deleted, days);
        Ok(deleted)
    }

    /// Aggregate counters for dashboards and the daily summary
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_items")
            .fetch_one(&self.pool)
            .await?;

        let today_start = today_start_utc();
        let today: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM news_items WHERE publish_time >= ?")
                .bind(today_start.to_rfc3339())
                .fetch_one(&self.pool)
                .await?;

        let mut by_source = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT source, COUNT(*) as count FROM news_items GROUP BY source ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            by_source.insert(
                row.get::<Option<String>, _>("source").unwrap_or_default(),
                row.get::<i64, _>("count"),
            );
        }

        let mut by_category = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT category, COUNT(*) as count FROM news_items GROUP BY category ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            by_category.insert(
                row.get::<Option<String>, _>("category").unwrap_or_default(),
                row.get::<i64, _>("count"),
            );
        }

        Ok(StoreStats { total, today, by_source, by_category })
    }

    /// Reclaim space after retention purges
    pub async fn optimize(&self) -> StoreResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        tracing::info!("Database vacuumed");
        Ok(())
    }

    // ========================================================================
    // Analysis results
    // ========================================================================

    /// Write an analysis result; latest wins per news_id. The referenced
    /// news item must exist.
    pub async fn save_analysis(&self, result: &AnalysisResult) -> StoreResult<bool> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM news_items WHERE id = ?")
            .bind(&result.news_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            tracing::warn!("Dropping analysis for unknown news id {}", result.news_id);
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM analysis_results WHERE news_id = ?")
            .bind(&result.news_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO analysis_results (news_id, impact_score, summary, analysis_time)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&result.news_id)
        .bind(clamp_score_f64(result.impact_score))
        .bind(&result.summary)
        .bind(result.analysis_time.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn latest_analysis(&self, news_id: &str) -> StoreResult<Option<AnalysisResult>> {
        let row = sqlx::query_as::<_, AnalysisResultRow>(
            r#"SELECT news_id, impact_score, summary, analysis_time
               FROM analysis_results WHERE news_id = ?
               ORDER BY id DESC LIMIT 1"#,
        )
        .bind(news_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AnalysisResult::from))
    }

    pub async fn analysis_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_results")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn today_start_utc() -> DateTime<Utc> {
    let today: NaiveDate = Utc::now().date_naive();
    today
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;

    async fn setup_store() -> NewsStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        NewsStore::new(pool)
    }

    fn item(title: &str, url: &str) -> NewsItem {
        let mut item =
            NewsItem::new(title.into(), format!("{} content", title), "ChinaNews".into(), url.into());
        item.category = "finance".into();
        item
    }

    #[tokio::test]
    async fn save_then_by_id_round_trips() {
        let store = setup_store().await;
        let mut news = item("央行降准", "https://example.com/a");
        news.keywords = vec!["央行".into(), "降准".into()];
        news.set_importance(85, "重大货币政策".into(), vec!["政策".into()]);

        assert!(store.save(&mut news).await.unwrap());
        let loaded = store.by_id(&news.id).await.unwrap().expect("item present");

        assert_eq!(loaded.title, news.title);
        assert_eq!(loaded.keywords, news.keywords);
        assert_eq!(loaded.importance_score, 85);
        assert_eq!(loaded.importance_factors, vec!["政策".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_title_url_is_noop() {
        let store = setup_store().await;
        let mut first = item("同一条新闻", "https://example.com/dup");
        assert!(store.save(&mut first).await.unwrap());

        let mut second = item("同一条新闻", "https://example.com/dup");
        assert!(!store.save(&mut second).await.unwrap());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn save_batch_with_duplicates_saves_once() {
        let store = setup_store().await;
        let mut items = vec![
            item("新闻A", "https://example.com/a"),
            item("新闻A", "https://example.com/a"),
            item("新闻B", "https://example.com/b"),
        ];
        let saved = store.save_batch(&mut items).await.unwrap();
        assert_eq!(saved, 2);

        // A second identical ingest saves nothing
        let mut again = vec![
            item("新闻A", "https://example.com/a"),
            item("新闻B", "https://example.com/b"),
        ];
        assert_eq!(store.save_batch(&mut again).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scores_are_clamped_on_ingress() {
        let store = setup_store().await;
        let mut news = item("越界分数", "https://example.com/clamp");
        news.importance_score = 250;
        store.save(&mut news).await.unwrap();
        let loaded = store.by_id(&news.id).await.unwrap().unwrap();
        assert_eq!(loaded.importance_score, 100);
    }

    #[tokio::test]
    async fn date_range_orders_by_importance_then_time() {
        let store = setup_store().await;
        for (title, score, minutes_ago) in
            [("低分新", 30, 1i64), ("高分旧", 90, 120), ("高分新", 90, 5)]
        {
            let mut news = item(title, &format!("https://example.com/{}", title));
            news.importance_score = score;
            news.publish_time = Utc::now() - chrono::Duration::minutes(minutes_ago);
            store.save(&mut news).await.unwrap();
        }

        let items = store
            .by_date_range(Utc::now() - chrono::Duration::days(1), Utc::now())
            .await
            .unwrap();
        let titles: Vec<_> = items.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["高分新", "高分旧", "低分新"]);
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let store = setup_store().await;
        for (title, source, minutes_ago) in [
            ("新浪新闻", "Sina", 30i64),
            ("中新网新闻一", "ChinaNews", 20),
            ("中新网新闻二", "ChinaNews", 10),
        ] {
            let mut news = item(title, &format!("https://example.com/{}", title));
            news.source = source.into();
            news.publish_time = Utc::now() - chrono::Duration::minutes(minutes_ago);
            store.save(&mut news).await.unwrap();
        }

        let q = NewsQuery {
            source: Some("ChinaNews".into()),
            limit: 10,
            ..Default::default()
        };
        let items = store.query(&q).await.unwrap();
        let titles: Vec<_> = items.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["中新网新闻二", "中新网新闻一"]);

        // Offset walks down the newest-first ordering
        let q = NewsQuery { limit: 1, offset: 1, ..Default::default() };
        let items = store.query(&q).await.unwrap();
        assert_eq!(items[0].title, "中新网新闻一");
    }

    #[tokio::test]
    async fn retention_purge_cascades_to_analyses() {
        let store = setup_store().await;

        let mut old_item = item("老新闻", "https://example.com/old");
        old_item.publish_time = Utc::now() - chrono::Duration::days(60);
        store.save(&mut old_item).await.unwrap();

        let mut fresh_item = item("新新闻", "https://example.com/new");
        store.save(&mut fresh_item).await.unwrap();

        for id in [&old_item.id, &fresh_item.id] {
            store
                .save_analysis(&AnalysisResult {
                    news_id: id.clone(),
                    impact_score: 60.0,
                    summary: "影响摘要".into(),
                    impact_degree: ImpactDegree::Medium,
                    analysis_time: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.analysis_count().await.unwrap(), 2);

        let deleted = store.delete_older_than(30).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.analysis_count().await.unwrap(), 1);
        assert!(store.by_id(&old_item.id).await.unwrap().is_none());
        assert!(store.latest_analysis(&fresh_item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn analysis_for_unknown_news_is_dropped() {
        let store = setup_store().await;
        let written = store
            .save_analysis(&AnalysisResult::error_sentinel("no-such-id"))
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(store.analysis_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn latest_analysis_wins_on_conflict() {
        let store = setup_store().await;
        let mut news = item("冲突", "https://example.com/conflict");
        store.save(&mut news).await.unwrap();

        for score in [40.0, 75.0] {
            store
                .save_analysis(&AnalysisResult {
                    news_id: news.id.clone(),
                    impact_score: score,
                    summary: format!("score {}", score),
                    impact_degree: ImpactDegree::Unknown,
                    analysis_time: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.analysis_count().await.unwrap(), 1);
        let latest = store.latest_analysis(&news.id).await.unwrap().unwrap();
        assert!((latest.impact_score - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn malformed_keyword_json_decodes_to_empty_list() {
        let store = setup_store().await;
        let mut news = item("坏关键词", "https://example.com/badkw");
        store.save(&mut news).await.unwrap();

        sqlx::query("UPDATE news_items SET keywords = 'not-json' WHERE id = ?")
            .bind(&news.id)
            .execute(store.pool())
            .await
            .unwrap();

        let loaded = store.by_id(&news.id).await.unwrap().unwrap();
        assert!(loaded.keywords.is_empty());
    }
}
