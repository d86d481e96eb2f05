//! Pipeline Orchestrator - named end-to-end cycles
//!
//! Each cycle is atomic at the cycle boundary: it either completes or
//! returns an error that the scheduler records as a job failure. Fan-out
//! happens inside the impact and deep analyzers; this module sequences
//! them.

use chrono::{Local, NaiveTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::models::{DeepAnalysisResult, NewsItem};
use crate::services::collector::NewsSource;
use crate::services::deep::DeepAnalyzer;
use crate::services::email::{
    self, EmailSender, ReportItem, instant_subject, summary_subject,
};
use crate::services::impact::ImpactAnalyzer;
use crate::services::importance::ImportanceScorer;
use crate::services::store::{NewsStore, NewsQuery};

/// Importance floor for the morning digest
const MORNING_SCORE_FLOOR: i32 = 50;

/// Importance floor for intraday instant dispatch
const INTRADAY_SCORE_FLOOR: i32 = 70;

/// Items at or above this count go through the batch analyzer
const BATCH_THRESHOLD: usize = 3;

/// Log files older than this are pruned by maintenance
const LOG_RETENTION_DAYS: u64 = 7;

/// Outcome of one full cycle
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub fetched: usize,
    pub saved: usize,
    pub items: Vec<NewsItem>,
    pub deep_results: Vec<DeepAnalysisResult>,
}

/// Orchestrates ingest, scoring, deep analysis, persistence, and
/// dispatch. All collaborators are injected; there is no global state.
pub struct PipelineOrchestrator {
    store: Arc<NewsStore>,
    collector: Arc<dyn NewsSource>,
    importance: ImportanceScorer,
    impact: Arc<ImpactAnalyzer>,
    deep: Option<Arc<DeepAnalyzer>>,
    email: Option<Arc<EmailSender>>,
    retention_days: i64,
    log_dir: Option<PathBuf>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<NewsStore>,
        collector: Arc<dyn NewsSource>,
        importance: ImportanceScorer,
        impact: Arc<ImpactAnalyzer>,
        deep: Option<Arc<DeepAnalyzer>>,
        email: Option<Arc<EmailSender>>,
        retention_days: i64,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self { store, collector, importance, impact, deep, email, retention_days, log_dir }
    }

    // ========================================================================
    // Core cycles
    // ========================================================================

    /// Ingest-only: fetch all feeds, drop known items, persist the rest.
    /// Returns the newly saved items.
    pub async fn ingest_only(&self) -> anyhow::Result<(usize, Vec<NewsItem>)> {
        let fetched = self.collector.collect_all().await;
        let fetched_count = fetched.len();

        let mut fresh = Vec::new();
        for item in fetched {
            if !self.store.exists(&item.title, &item.url).await? {
                fresh.push(item);
            }
        }

        let saved = self.store.save_batch(&mut fresh).await?;
        tracing::info!("Ingest cycle: fetched {}, saved {} new items", fetched_count, saved);

        Ok((fetched_count, fresh))
    }

    /// Score-and-analyze: ingest, then importance-score and
    /// impact-analyze every new item, persisting both annotations.
    pub async fn score_and_analyze(&self) -> anyhow::Result<CycleOutcome> {
        let (fetched, mut items) = self.ingest_only().await?;

        if items.is_empty() {
            tracing::info!("No new items to analyze");
            return Ok(CycleOutcome { fetched, ..Default::default() });
        }

        // Importance pass, serial (the scorer never fails)
        for item in items.iter_mut() {
            let assessment = self.importance.score(item).await;
            item.set_importance(assessment.score, assessment.reasoning, assessment.key_factors);
        }

        // Impact pass: batch for 3+ items, serial otherwise
        let analyses = if items.len() >= BATCH_THRESHOLD {
            Arc::clone(&self.impact).analyze_batch(&items).await
        } else {
            let mut results = Vec::with_capacity(items.len());
            for item in &items {
                let result = match self.impact.analyze(item).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!("Impact analysis failed for '{}': {}", item.title, e);
                        crate::models::AnalysisResult::error_sentinel(&item.id)
                    },
                };
                results.push(result);
            }
            results
        };

        for (item, analysis) in items.iter_mut().zip(analyses.iter()) {
            item.impact_degree = analysis.impact_degree;
            if let Err(e) = self.store.save_analysis(analysis).await {
                tracing::error!("Failed to persist analysis for {}: {}", item.id, e);
            }
        }

        let saved = self.store.save_batch(&mut items).await?;
        tracing::info!(
            "Score-and-analyze cycle: {} items scored and analyzed ({} persisted)",
            items.len(),
            saved
        );

        Ok(CycleOutcome { fetched, saved, items, deep_results: Vec::new() })
    }

    /// Full cycle: score-and-analyze, then deep-analyze the
    /// high-importance slice and write back adjusted scores.
    pub async fn full_cycle(&self) -> anyhow::Result<CycleOutcome> {
        let mut outcome = self.score_and_analyze().await?;

        let Some(deep) = &self.deep else {
            return Ok(outcome);
        };

        let candidates: Vec<NewsItem> = outcome
            .items
            .iter()
            .filter(|item| deep.should_analyze(item))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Ok(outcome);
        }

        tracing::info!("Deep analysis over {} high-importance items", candidates.len());
        let deep_results = Arc::clone(deep).analyze_batch(&candidates).await;

        // Replace importance with the adjusted score, in memory and in
        // the store
        for result in &deep_results {
            if result.model_used == "skip" || result.model_used == "error" {
                continue;
            }
            if let Some(item) = outcome.items.iter_mut().find(|i| i.id == result.news_id) {
                item.importance_score = result.adjusted_score;
                if let Err(e) = self.store.save(item).await {
                    tracing::error!("Failed to write back adjusted score for {}: {}", item.id, e);
                }
            }
        }

        outcome.deep_results = deep_results;
        Ok(outcome)
    }

    // ========================================================================
    // Dispatch cycles
    // ========================================================================

    /// Morning digest: full cycle, then report every item scoring at
    /// least 50.
    pub async fn morning_digest(&self) -> anyhow::Result<()> {
        let outcome = self.full_cycle().await?;
        let selected = filter_by_score(&outcome.items, MORNING_SCORE_FLOOR);

        if selected.is_empty() {
            tracing::info!(
                "Morning digest: {} items collected, none at {}+ points, not sending",
                outcome.items.len(),
                MORNING_SCORE_FLOOR
            );
            return Ok(());
        }

        self.dispatch_report("早间新闻报告", &selected).await
    }

    /// Intraday tick: only inside the 08:00-16:00 local window; sends
    /// only when something scores 70+.
    pub async fn intraday_tick(&self) -> anyhow::Result<()> {
        if !within_trading_hours(Local::now().time()) {
            tracing::debug!("Outside trading hours, skipping intraday collection");
            return Ok(());
        }

        let outcome = self.full_cycle().await?;
        let urgent = filter_by_score(&outcome.items, INTRADAY_SCORE_FLOOR);

        if urgent.is_empty() {
            tracing::info!(
                "Intraday tick: {} items persisted, none at {}+ points, no email",
                outcome.items.len(),
                INTRADAY_SCORE_FLOOR
            );
            return Ok(());
        }

        self.dispatch_report("交易时间重要新闻", &urgent).await
    }

    /// Evening collection: full cycle, never sends.
    pub async fn evening_collection(&self) -> anyhow::Result<()> {
        let outcome = self.full_cycle().await?;
        tracing::info!(
            "Evening collection: {} items persisted, no email by design",
            outcome.items.len()
        );
        Ok(())
    }

    /// Daily summary: today's stored items, no score floor.
    pub async fn daily_summary(&self) -> anyhow::Result<()> {
        let start = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| {
                naive
                    .and_local_timezone(Local)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now)
            })
            .unwrap_or_else(Utc::now);

        let items = self.store.by_date_range(start, Utc::now()).await?;
        if items.is_empty() {
            tracing::info!("Daily summary: no items today, skipping email");
            return Ok(());
        }

        let report_items = self.pair_with_analyses(&items).await;
        let stats = self.store.stats().await?;
        let html = email::render_daily_summary(&report_items, &stats, Local::now());

        let Some(sender) = &self.email else {
            tracing::warn!("Email not configured, daily summary rendered but not sent");
            return Ok(());
        };

        sender
            .send_report(&summary_subject(Local::now()), &report_items, html)
            .await?;
        tracing::info!("Daily summary sent: {} items", report_items.len());
        Ok(())
    }

    /// Maintenance: retention purge, vacuum, and log pruning.
    pub async fn maintenance(&self) -> anyhow::Result<()> {
        let deleted = self.store.delete_older_than(self.retention_days).await?;
        if deleted > 0 {
            self.store.optimize().await?;
        }

        if let Some(log_dir) = &self.log_dir {
            prune_old_logs(log_dir, LOG_RETENTION_DAYS);
        }

        let stats = self.store.stats().await?;
        tracing::info!(
            "Maintenance complete: {} purged, {} total items, {} today",
            deleted,
            stats.total,
            stats.today
        );
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn dispatch_report(&self, title: &str, items: &[NewsItem]) -> anyhow::Result<()> {
        let report_items = self.pair_with_analyses(items).await;
        let html = email::render_report(&report_items, title, Local::now());

        let Some(sender) = &self.email else {
            tracing::warn!("Email not configured, '{}' rendered but not sent", title);
            return Ok(());
        };

        sender
            .send_report(&instant_subject(title, Local::now()), &report_items, html)
            .await?;
        tracing::info!("'{}' sent with {} items", title, report_items.len());
        Ok(())
    }

    async fn pair_with_analyses(&self, items: &[NewsItem]) -> Vec<ReportItem> {
        let mut report_items = Vec::with_capacity(items.len());
        for item in items {
            let analysis = self.store.latest_analysis(&item.id).await.ok().flatten();
            report_items.push(ReportItem { news: item.clone(), analysis });
        }
        report_items
    }

    /// Recent items, newest first (status/dashboard helper)
    pub async fn recent_items(&self, limit: i64) -> anyhow::Result<Vec<NewsItem>> {
        Ok(self.store.query(&NewsQuery::latest(limit)).await?)
    }
}

/// Sort a score-filtered slice by importance, descending
pub fn filter_by_score(items: &[NewsItem], min_score: i32) -> Vec<NewsItem> {
    let mut selected: Vec<NewsItem> = items
        .iter()
        .filter(|item| item.importance_score >= min_score)
        .cloned()
        .collect();
    selected.sort_by(|a, b| b.importance_score.cmp(&a.importance_score));
    selected
}

/// The literal 08:00-16:00 local window, boundaries inclusive
pub fn within_trading_hours(now: NaiveTime) -> bool {
    let open = NaiveTime::from_hms_opt(8, 0, 0).expect("valid time");
    let close = NaiveTime::from_hms_opt(16, 0, 0).expect("valid time");
    now >= open && now <= close
}

/// Remove files in the log directory not modified within the retention
/// window. Failures are logged, never raised.
fn prune_old_logs(log_dir: &PathBuf, retention_days: u64) {
    let cutoff = SystemTime::now()
        - std::time::Duration::from_secs(retention_days * 24 * 3600);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Log directory {} not readable: {}", log_dir.display(), e);
            return;
        },
    };

    let mut pruned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        pruned += 1;
                        tracing::debug!("Pruned old log file: {}", path.display());
                    },
                    Err(e) => tracing::warn!("Failed to prune {}: {}", path.display(), e),
                }
            }
        }
    }

    if pruned > 0 {
        tracing::info!("Pruned {} log files older than {} days", pruned, retention_days);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored_item(title: &str, score: i32) -> NewsItem {
        let mut item = NewsItem::new(
            title.into(),
            "内容".into(),
            "ChinaNews".into(),
            format!("https://example.com/{}", title),
        );
        item.importance_score = score;
        item
    }

    #[test]
    fn score_filter_selects_and_sorts() {
        let items = vec![
            scored_item("a", 10),
            scored_item("b", 75),
            scored_item("c", 50),
            scored_item("d", 90),
        ];
        let selected = filter_by_score(&items, 50);
        let titles: Vec<&str> = selected.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["d", "b", "c"]);
    }

    #[test]
    fn trading_window_is_literal_and_inclusive() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(!within_trading_hours(t(7, 59)));
        assert!(within_trading_hours(t(8, 0)));
        assert!(within_trading_hours(t(10, 30)));
        assert!(within_trading_hours(t(16, 0)));
        assert!(!within_trading_hours(t(16, 1)));
        assert!(!within_trading_hours(t(23, 0)));
    }

    #[test]
    fn log_pruning_respects_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let old_file = dir.path().join("old.log");
        let new_file = dir.path().join("new.log");
        std::fs::write(&old_file, "old").unwrap();
        std::fs::write(&new_file, "new").unwrap();

        // Backdate the old file past the retention window
        let old_time = SystemTime::now() - std::time::Duration::from_secs(10 * 24 * 3600);
        let file = std::fs::File::options().write(true).open(&old_file).unwrap();
        file.set_modified(old_time).unwrap();
        drop(file);

        prune_old_logs(&dir.path().to_path_buf(), LOG_RETENTION_DAYS);

        assert!(!old_file.exists());
        assert!(new_file.exists());
    }
}
