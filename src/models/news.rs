//! News Data Models
//!
//! Core data structures for ingested news and its analysis annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Clamp an importance/impact score into the storable range.
pub fn clamp_score_i32(score: i32) -> i32 {
    score.clamp(0, 100)
}

/// Clamp a floating-point impact score into the storable range.
pub fn clamp_score_f64(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

// ============================================================================
// Impact degree
// ============================================================================

/// Impact degree tag attached to a news item by the impact analyzer.
/// The store treats this as an opaque passthrough value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactDegree {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl ImpactDegree {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Unknown => "",
        }
    }

    pub fn parse_degree(s: &str) -> Self {
        match s {
            "high" | "高" => Self::High,
            "medium" | "中" => Self::Medium,
            "low" | "低" => Self::Low,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// News item
// ============================================================================

/// One piece of ingested news with its analysis annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    /// Stable identifier derived from (source, title, url, first-seen time)
    pub id: String,
    pub title: String,
    pub content: String,
    pub source: String,
    pub url: String,
    pub category: String,
    pub publish_time: DateTime<Utc>,
    pub keywords: Vec<String>,
    /// Market importance in [0, 100]; 0 until the importance scorer runs,
    /// replaced by the deep analyzer's adjusted score when deep analysis runs
    pub importance_score: i32,
    pub importance_reasoning: String,
    pub importance_factors: Vec<String>,
    pub impact_degree: ImpactDegree,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewsItem {
    /// Construct a fresh item as the feed ingestor sees it
    pub fn new(title: String, content: String, source: String, url: String) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title,
            content,
            source,
            url,
            category: String::new(),
            publish_time: now,
            keywords: Vec::new(),
            importance_score: 0,
            importance_reasoning: String::new(),
            importance_factors: Vec::new(),
            impact_degree: ImpactDegree::Unknown,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the stable id: `{source}_{hash(title+url):x}_{unix_ts}`.
    /// A UUID stands in when there is nothing to hash.
    pub fn derive_id(&self) -> String {
        if self.source.is_empty() && self.title.is_empty() && self.url.is_empty() {
            return Uuid::new_v4().to_string();
        }
        let mut h = DefaultHasher::new();
        self.title.hash(&mut h);
        self.url.hash(&mut h);
        format!("{}_{:x}_{}", self.source, h.finish(), self.created_at.timestamp())
    }

    /// Assign the derived id if none was set yet
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = self.derive_id();
        }
    }

    pub fn set_importance(&mut self, score: i32, reasoning: String, factors: Vec<String>) {
        self.importance_score = clamp_score_i32(score);
        self.importance_reasoning = reasoning;
        self.importance_factors = factors;
    }
}

// ============================================================================
// Impact analysis result
// ============================================================================

/// Output of the impact analyzer for a single news item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub news_id: String,
    /// Impact rating in [0, 100]
    pub impact_score: f64,
    pub summary: String,
    /// Degree tag carried alongside for the news item; not persisted with
    /// the analysis row
    pub impact_degree: ImpactDegree,
    pub analysis_time: DateTime<Utc>,
}

impl AnalysisResult {
    /// Placeholder produced when a batch worker fails; the batch continues.
    pub fn error_sentinel(news_id: &str) -> Self {
        Self {
            news_id: news_id.to_string(),
            impact_score: 0.0,
            summary: "分析过程中出现错误，无法生成有效分析".to_string(),
            impact_degree: ImpactDegree::Unknown,
            analysis_time: Utc::now(),
        }
    }
}

// ============================================================================
// Deep analysis result
// ============================================================================

/// Output of the deep analyzer's iterative research loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysisResult {
    pub news_id: String,
    pub title: String,
    pub original_score: i32,
    /// Importance score after evidence-based adjustment, in [0, 100]
    pub adjusted_score: i32,
    /// Queries actually executed
    pub search_keywords: Vec<String>,
    /// Concatenated evidence excerpts
    pub search_results_summary: String,
    pub deep_analysis_report: String,
    pub analysis_time: DateTime<Utc>,
    /// True iff at least one query returned useful evidence
    pub search_success: bool,
    /// Provider model identifier, or the sentinels "skip" / "error"
    pub model_used: String,
}

impl DeepAnalysisResult {
    /// Item below the score threshold: scores unchanged, nothing searched.
    pub fn skipped(item: &NewsItem) -> Self {
        Self {
            news_id: item.id.clone(),
            title: item.title.clone(),
            original_score: item.importance_score,
            adjusted_score: item.importance_score,
            search_keywords: Vec::new(),
            search_results_summary: "未触发深度分析条件".to_string(),
            deep_analysis_report: "该新闻重要性分数未达到深度分析阈值".to_string(),
            analysis_time: Utc::now(),
            search_success: false,
            model_used: "skip".to_string(),
        }
    }

    pub fn errored(item: &NewsItem, message: &str) -> Self {
        Self {
            news_id: item.id.clone(),
            title: item.title.clone(),
            original_score: item.importance_score,
            adjusted_score: item.importance_score,
            search_keywords: Vec::new(),
            search_results_summary: format!("分析过程出错: {}", message),
            deep_analysis_report: "由于技术问题，无法完成深度分析".to_string(),
            analysis_time: Utc::now(),
            search_success: false,
            model_used: "error".to_string(),
        }
    }
}
