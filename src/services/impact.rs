//! Impact Analyzer - rates market impact of news items
//!
//! Single-item analysis delegates to the LLM client (which owns retry
//! and fallback routing). The batch form is a bounded-concurrency pool:
//! a semaphore caps in-flight requests, the shared sliding-window
//! limiter caps request rate, and output order always matches input
//! order. A failed item yields a placeholder result, never aborts the
//! batch.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::AnalysisParams;
use crate::models::{AnalysisResult, ImpactDegree, NewsItem, clamp_score_f64};
use crate::services::importance::extract_balanced_json;
use crate::services::llm::{ChatCompletion, ChatOptions, LlmError};
use crate::utils::{SlidingWindowLimiter, truncate_chars};

const SYSTEM_PROMPT: &str = "你是一位专业的A股市场分析师，具有丰富的股票投资经验和深厚的市场洞察力。请严格按照要求的JSON格式输出分析结果。";

/// Pause between sub-batches to smooth bursts into the rate limiter
const SUB_BATCH_PAUSE: Duration = Duration::from_millis(500);

const MAX_SUMMARY_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct ImpactResponse {
    #[serde(default)]
    impact_score: Option<f64>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    impact_level: Option<String>,
}

/// News impact analyzer with a concurrency-aware batch form
pub struct ImpactAnalyzer {
    llm: Arc<dyn ChatCompletion>,
    limiter: Arc<SlidingWindowLimiter>,
    semaphore: Arc<Semaphore>,
    params: AnalysisParams,
}

impl ImpactAnalyzer {
    pub fn new(
        llm: Arc<dyn ChatCompletion>,
        limiter: Arc<SlidingWindowLimiter>,
        params: AnalysisParams,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(params.max_concurrent.max(1)));
        Self { llm, limiter, semaphore, params }
    }

    /// Analyze one item. Parse failure raises; the caller decides whether
    /// to place a sentinel.
    pub async fn analyze(&self, item: &NewsItem) -> Result<AnalysisResult, LlmError> {
        let prompt = build_impact_prompt(item);
        let opts = ChatOptions {
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            timeout: Duration::from_secs(self.params.timeout),
            ..Default::default()
        };

        let response = self.llm.chat(&prompt, &opts).await?;
        parse_impact_response(&item.id, &response)
    }

    /// Analyze a batch; output order matches input order and
    /// `results[i].news_id == items[i].id` always holds.
    pub async fn analyze_batch(self: Arc<Self>, items: &[NewsItem]) -> Vec<AnalysisResult> {
        if items.is_empty() {
            return Vec::new();
        }

        tracing::info!(
            "Starting batch impact analysis: {} items, max_concurrent={}, rate_limit={}/min",
            items.len(),
            self.params.max_concurrent,
            self.params.rate_limit
        );

        let mut results: Vec<Option<AnalysisResult>> = (0..items.len()).map(|_| None).collect();
        let batch_size = self.params.batch_size.max(1);

        for (batch_index, chunk) in items.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(SUB_BATCH_PAUSE).await;
            }

            let offset = batch_index * batch_size;
            let mut handles = Vec::with_capacity(chunk.len());

            for (i, item) in chunk.iter().cloned().enumerate() {
                let analyzer = Arc::clone(&self);
                handles.push(tokio::spawn(async move {
                    let _permit = analyzer
                        .semaphore
                        .acquire()
                        .await
                        .expect("semaphore never closed");
                    analyzer.limiter.acquire().await;

                    let result = match analyzer.analyze(&item).await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!("Impact analysis failed for '{}': {}", item.title, e);
                            AnalysisResult::error_sentinel(&item.id)
                        },
                    };
                    (offset + i, result)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((index, result)) => results[index] = Some(result),
                    Err(e) => tracing::error!("Impact analysis worker panicked: {}", e),
                }
            }
        }

        // Any slot a panicked worker left empty still gets its sentinel
        results
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| AnalysisResult::error_sentinel(&items[i].id)))
            .collect()
    }
}

fn build_impact_prompt(item: &NewsItem) -> String {
    format!(
        r#"请你作为一位专业的A股市场分析师，对以下新闻进行深度分析，重点关注其对A股市场的影响。

新闻信息：
标题：{title}
内容：{content}
来源：{source}
发布时间：{publish_time}
关键词：{keywords}

请按照以下JSON格式输出分析结果：
{{
    "impact_score": 数值(0到100，数值越高影响越大),
    "summary": "新闻影响摘要(100字以内)",
    "impact_level": "影响级别(高/中/低)"
}}

分析要求：
1. 影响评分范围：0（无影响）到 100（极度影响），数值越高影响越大
2. 摘要要具体、可操作，避免模糊表述

请确保输出严格按照JSON格式，不要包含其他文本。"#,
        title = item.title,
        content = item.content,
        source = item.source,
        publish_time = item.publish_time.to_rfc3339(),
        keywords = item.keywords.join(", "),
    )
}

/// Parse the model's JSON. The degree tag is passed through when the
/// model names one; otherwise it falls out of the numeric score.
pub fn parse_impact_response(news_id: &str, response: &str) -> Result<AnalysisResult, LlmError> {
    let json_str = extract_balanced_json(response).ok_or_else(|| {
        LlmError::ParseError(format!(
            "no JSON object in response: {}",
            truncate_chars(response, 200)
        ))
    })?;

    let parsed: ImpactResponse = serde_json::from_str(&json_str)
        .map_err(|e| LlmError::ParseError(format!("invalid impact JSON: {}", e)))?;

    let impact_score = clamp_score_f64(
        parsed
            .impact_score
            .ok_or_else(|| LlmError::ParseError("missing impact_score".to_string()))?,
    );

    let impact_degree = match parsed.impact_level.as_deref() {
        Some(tag) if ImpactDegree::parse_degree(tag) != ImpactDegree::Unknown => {
            ImpactDegree::parse_degree(tag)
        },
        _ => degree_for_score(impact_score),
    };

    Ok(AnalysisResult {
        news_id: news_id.to_string(),
        impact_score,
        summary: truncate_chars(parsed.summary.trim(), MAX_SUMMARY_CHARS),
        impact_degree,
        analysis_time: chrono::Utc::now(),
    })
}

/// Degree buckets used when the model omits its own tag
pub fn degree_for_score(score: f64) -> ImpactDegree {
    if score >= 70.0 {
        ImpactDegree::High
    } else if score >= 40.0 {
        ImpactDegree::Medium
    } else {
        ImpactDegree::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_response_parses_with_clamp() {
        let response = r#"{"impact_score": 120.5, "summary": "重大利好", "impact_level": "高"}"#;
        let result = parse_impact_response("news-1", response).unwrap();
        assert_eq!(result.news_id, "news-1");
        assert!((result.impact_score - 100.0).abs() < f64::EPSILON);
        assert_eq!(result.impact_degree, ImpactDegree::High);
    }

    #[test]
    fn missing_score_raises_parse_error() {
        let result = parse_impact_response("n", r#"{"summary": "没有分数"}"#);
        assert!(matches!(result, Err(LlmError::ParseError(_))));
    }

    #[test]
    fn non_json_raises_parse_error() {
        let result = parse_impact_response("n", "抱歉，我无法给出JSON。");
        assert!(matches!(result, Err(LlmError::ParseError(_))));
    }

    #[test]
    fn degree_falls_back_to_score_buckets() {
        let response = r#"{"impact_score": 45, "summary": "一般影响"}"#;
        let result = parse_impact_response("n", response).unwrap();
        assert_eq!(result.impact_degree, ImpactDegree::Medium);

        assert_eq!(degree_for_score(80.0), ImpactDegree::High);
        assert_eq!(degree_for_score(10.0), ImpactDegree::Low);
    }

    #[test]
    fn summary_is_trimmed_to_contract_length() {
        let long_summary = "影".repeat(300);
        let response = format!(r#"{{"impact_score": 50, "summary": "{}"}}"#, long_summary);
        let result = parse_impact_response("n", &response).unwrap();
        assert!(result.summary.chars().count() <= MAX_SUMMARY_CHARS);
    }
}
