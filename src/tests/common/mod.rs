//! Shared test fixtures: in-memory store, scripted LLM, scripted search.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::db::init_schema;
use crate::models::NewsItem;
use crate::services::collector::NewsSource;
use crate::services::llm::{ChatCompletion, ChatOptions, LlmError};
use crate::services::search::WebSearch;
use crate::services::store::NewsStore;

pub async fn memory_store() -> Arc<NewsStore> {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    init_schema(&pool).await.expect("Failed to init schema");
    Arc::new(NewsStore::new(pool))
}

pub fn sample_item(title: &str, score: i32) -> NewsItem {
    let mut item = NewsItem::new(
        title.to_string(),
        format!("{} 的详细内容，涉及市场与政策动向。", title),
        "ChinaNews".to_string(),
        format!("https://news.example.com/{}", title),
    );
    item.category = "finance".to_string();
    item.importance_score = score;
    item
}

// ============================================================================
// Scripted LLM
// ============================================================================

/// Routes each prompt to a canned answer by inspecting which stage the
/// prompt belongs to. Counts calls for rate/ordering assertions.
pub struct MockChat {
    pub importance_response: String,
    pub impact_response: String,
    pub plan_response: String,
    pub report_response: String,
    pub calls: AtomicUsize,
    /// When true, every call fails with a transport error
    pub failing: bool,
}

impl Default for MockChat {
    fn default() -> Self {
        Self {
            importance_response:
                r#"{"importance_score": 85, "reasoning": "重大政策变化", "key_factors": ["政策", "流动性"]}"#
                    .to_string(),
            impact_response:
                r#"{"impact_score": 72.0, "summary": "对银行板块构成显著利好", "impact_level": "高"}"#
                    .to_string(),
            plan_response: "1. 央行降准 市场影响\n2. 银行板块 流动性 分析".to_string(),
            report_response:
                "分析报告：本次降准释放长期资金，利好银行与地产板块，关注后续货币政策节奏。"
                    .to_string(),
            calls: AtomicUsize::new(0),
            failing: false,
        }
    }
}

impl MockChat {
    pub fn failing() -> Self {
        Self { failing: true, ..Default::default() }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatCompletion for MockChat {
    async fn chat(&self, prompt: &str, _opts: &ChatOptions) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.failing {
            return Err(LlmError::ApiError("connection reset".to_string()));
        }

        let response = if prompt.contains("搜索查询词") {
            &self.plan_response
        } else if prompt.contains("深度分析报告") {
            &self.report_response
        } else if prompt.contains("impact_score") {
            &self.impact_response
        } else {
            &self.importance_response
        };
        Ok(response.clone())
    }

    fn model_name(&self) -> String {
        "mock-model".to_string()
    }
}

// ============================================================================
// Scripted search
// ============================================================================

/// Returns a fixed evidence blob; `ok` follows the scripted pattern,
/// cycling per call.
pub struct MockSearch {
    pub evidence: String,
    pub ok_pattern: Vec<bool>,
    pub calls: AtomicUsize,
}

impl MockSearch {
    pub fn always_ok(evidence: &str) -> Self {
        Self { evidence: evidence.to_string(), ok_pattern: vec![true], calls: AtomicUsize::new(0) }
    }

    pub fn with_pattern(evidence: &str, ok_pattern: Vec<bool>) -> Self {
        Self { evidence: evidence.to_string(), ok_pattern, calls: AtomicUsize::new(0) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WebSearch for MockSearch {
    async fn search(&self, query: &str, _max_results: usize) -> (String, bool) {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let ok = self.ok_pattern[call % self.ok_pattern.len()];
        if ok {
            (format!("【{}】{}", query, self.evidence), true)
        } else {
            (format!("搜索关键词'{}'未获取到有效结果", query), false)
        }
    }
}

// ============================================================================
// Scripted news source
// ============================================================================

/// Serves the same fixed batch on every collection pass
pub struct MockNewsSource {
    pub items: Vec<NewsItem>,
}

#[async_trait]
impl NewsSource for MockNewsSource {
    async fn collect_all(&self) -> Vec<NewsItem> {
        self.items
            .iter()
            .map(|item| {
                // Fresh copies without ids, as the ingestor would yield
                let mut copy = item.clone();
                copy.id = String::new();
                copy
            })
            .collect()
    }
}
