//! Deep Analyzer - iterative AI-driven research loop
//!
//! For items at or above the importance threshold: plan 1-3 search
//! queries, execute them sequentially with early stop, score the
//! retrieved evidence, synthesize a bounded report, and adjust the
//! importance score additively from evidence quality and report content.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::DeepAnalysisConfig;
use crate::models::{DeepAnalysisResult, NewsItem, clamp_score_i32};
use crate::services::llm::{ChatCompletion, ChatOptions};
use crate::services::search::WebSearch;
use crate::utils::{prefix_chars, truncate_chars};

// ============================================================================
// Keyword tables
// ============================================================================

static AUTHORITY_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["央行", "证监会", "银保监", "财政部", "国务院", "发改委", "官方", "权威", "政府", "监管"]
});

static INFO_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["数据", "报告", "分析", "统计", "研究", "调查", "发布", "公告"]
});

static TIME_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["最新", "今日", "刚刚", "近期", "本周", "昨日", "2024", "2025", "2026"]
});

static HIGH_IMPACT_KEYWORDS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["重大", "突破", "重要", "关键", "显著", "大幅", "急剧"]);

static MARKET_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["股市", "市场", "投资", "板块", "个股", "涨", "跌", "资金"]
});

static REPORT_PREFIXES: &[&str] = &["深度分析报告：", "深度分析报告:", "分析报告：", "分析报告:", "报告：", "报告:", "分析：", "分析:"];

static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+[\.、．)）]?\s*(.+)$").expect("invalid list regex"));

static TITLE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[一-鿿]{2,8}|[A-Za-z0-9]{2,}").expect("invalid token regex"));

/// One successful search with its quality score
#[derive(Debug, Clone)]
pub struct Evidence {
    pub query: String,
    pub text: String,
    pub quality: f64,
}

// ============================================================================
// Analyzer
// ============================================================================

/// Deep analyzer over the LLM and web-search seams
pub struct DeepAnalyzer {
    llm: Arc<dyn ChatCompletion>,
    search: Arc<dyn WebSearch>,
    config: DeepAnalysisConfig,
    semaphore: Arc<Semaphore>,
}

impl DeepAnalyzer {
    pub fn new(
        llm: Arc<dyn ChatCompletion>,
        search: Arc<dyn WebSearch>,
        config: DeepAnalysisConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { llm, search, config, semaphore }
    }

    /// Gate: deep analysis runs only at or above the score threshold
    pub fn should_analyze(&self, item: &NewsItem) -> bool {
        self.config.enabled && item.importance_score >= self.config.score_threshold
    }

    /// Run the full research loop for one item. Never fails: LLM and
    /// search problems degrade to conservative fallbacks.
    pub async fn analyze_deep(&self, item: &NewsItem) -> DeepAnalysisResult {
        if !self.should_analyze(item) {
            tracing::debug!("Deep analysis skipped (score {}): {}", item.importance_score, item.title);
            return DeepAnalysisResult::skipped(item);
        }

        tracing::info!(
            "Deep analysis started: {}... ({})",
            truncate_chars(&item.title, 30),
            item.importance_score
        );

        // 1. Plan queries
        let queries = self.plan_queries(item).await;

        // 2. Search sequentially with early stop
        let (evidences, executed) = self.gather_evidence(&item.title, &queries).await;
        let search_success = !evidences.is_empty();

        // 3. Keep the best evidence, concatenated into the summary
        let evidence_summary = render_evidence_summary(&evidences, self.config.max_evidence_kept);

        // 4. Synthesize the report
        let report = self.synthesize_report(item, &evidence_summary, &executed).await;

        // 5. Adjust the importance score
        let adjusted_score = if self.config.enable_score_adjustment && search_success {
            adjust_score(item.importance_score, &evidences, &report, &evidence_summary)
        } else {
            item.importance_score
        };

        tracing::info!(
            "Deep analysis complete: {}... {} -> {}",
            truncate_chars(&item.title, 30),
            item.importance_score,
            adjusted_score
        );

        DeepAnalysisResult {
            news_id: item.id.clone(),
            title: item.title.clone(),
            original_score: item.importance_score,
            adjusted_score,
            search_keywords: executed,
            search_results_summary: evidence_summary,
            deep_analysis_report: report,
            analysis_time: chrono::Utc::now(),
            search_success,
            model_used: self.llm.model_name(),
        }
    }

    /// Batch fan-out with bounded concurrency. Output order matches
    /// input order; a panicked worker yields the error sentinel.
    pub async fn analyze_batch(self: Arc<Self>, items: &[NewsItem]) -> Vec<DeepAnalysisResult> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(items.len());
        for (i, item) in items.iter().cloned().enumerate() {
            let analyzer = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let _permit = analyzer
                    .semaphore
                    .acquire()
                    .await
                    .expect("semaphore never closed");
                (i, analyzer.analyze_deep(&item).await)
            }));
        }

        let mut results: Vec<Option<DeepAnalysisResult>> = (0..items.len()).map(|_| None).collect();
        for handle in handles {
            match handle.await {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => tracing::error!("Deep analysis worker panicked: {}", e),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| DeepAnalysisResult::errored(&items[i], "worker panicked"))
            })
            .collect()
    }

    /// Ask the model for 1-3 complementary queries; fall back to a
    /// title-derived query when planning yields nothing.
    async fn plan_queries(&self, item: &NewsItem) -> Vec<String> {
        let prompt = format!(
            r#"针对以下财经新闻，请给出1-3个互补的搜索查询词，用于检索相关背景信息。
第一个查询围绕新闻本身的主题，其余查询覆盖相关行业或政策背景。

新闻标题：{title}
新闻内容：{content}

请按编号列表返回，每行一个查询词，不要附加其他说明。"#,
            title = item.title,
            content = truncate_chars(&item.content, 300),
        );

        let opts = ChatOptions {
            max_tokens: Some(200),
            timeout: Duration::from_secs(60),
            ..Default::default()
        };

        let planned = match self.llm.chat(&prompt, &opts).await {
            Ok(response) => parse_query_plan(&response),
            Err(e) => {
                tracing::warn!("Query planning failed, using fallback: {}", e);
                Vec::new()
            },
        };

        if planned.is_empty() {
            return vec![format!("{} 相关信息", prefix_chars(&item.title, 25))];
        }

        planned
            .into_iter()
            .take(self.config.max_search_rounds.clamp(1, 3))
            .collect()
    }

    /// Execute queries sequentially; stop once `evidence_threshold`
    /// successful searches have accumulated. Returns the scored
    /// evidence plus every query actually executed.
    async fn gather_evidence(
        &self,
        title: &str,
        queries: &[String],
    ) -> (Vec<Evidence>, Vec<String>) {
        let mut evidences = Vec::new();
        let mut executed = Vec::new();

        for query in queries {
            if evidences.len() >= self.config.evidence_threshold {
                break;
            }

            executed.push(query.clone());

            let attempts = self.config.search_retry_count.max(1);
            for attempt in 1..=attempts {
                let (text, ok) = self.search.search(query, 3).await;
                if ok {
                    let quality = evidence_quality(title, &text);
                    tracing::debug!("Evidence '{}' quality {:.1}", query, quality);
                    evidences.push(Evidence { query: query.clone(), text, quality });
                    break;
                }
                if attempt < attempts {
                    tracing::debug!("Search retry {}/{} for '{}'", attempt, attempts, query);
                }
            }
        }

        (evidences, executed)
    }

    /// One LLM call over the item and its evidence produces the bounded
    /// report; failures degrade to a deterministic summary.
    async fn synthesize_report(
        &self,
        item: &NewsItem,
        evidence_summary: &str,
        executed: &[String],
    ) -> String {
        let prompt = format!(
            r#"作为专业的财经分析师，请对以下新闻进行深度分析。

原始新闻：
标题：{title}
内容：{content}
来源：{source}
重要性分数：{score}分

相关背景信息（通过搜索关键词"{keywords}"获取）：
{evidence}

请基于原始新闻和背景信息，生成一份{max_len}字以内的深度分析报告，重点分析：
1. 新闻的深层影响和意义
2. 对相关行业或市场的潜在影响
3. 可能的发展趋势
4. 投资者需要关注的要点

要求：
- 专业、客观、准确
- 控制在{max_len}字以内
- 重点突出，条理清晰
- 结合背景信息提供更深层次的洞察

深度分析报告："#,
            title = item.title,
            content = item.content,
            source = item.source,
            score = item.importance_score,
            keywords = executed.join("、"),
            evidence = evidence_summary,
            max_len = self.config.report_max_length,
        );

        let opts = ChatOptions {
            max_tokens: Some(self.config.max_tokens),
            timeout: Duration::from_secs(120),
            ..Default::default()
        };

        match self.llm.chat(&prompt, &opts).await {
            Ok(response) => clean_report(&response, self.config.report_max_length),
            Err(e) => {
                tracing::error!("Report synthesis failed: {}", e);
                fallback_report(item, evidence_summary, executed, self.config.report_max_length)
            },
        }
    }
}

// ============================================================================
// Pure pieces of the loop (unit-tested directly)
// ============================================================================

/// Parse the planning response as a numbered list
pub fn parse_query_plan(response: &str) -> Vec<String> {
    let mut queries = Vec::new();
    for line in response.lines() {
        if let Some(caps) = NUMBERED_LINE.captures(line) {
            let query = caps[1].trim().trim_matches(['"', '“', '”']).to_string();
            if !query.is_empty() && !queries.contains(&query) {
                queries.push(query);
            }
        }
    }
    queries.truncate(3);
    queries
}

/// Quality score in [0, 10] for one evidence blob, relative to the
/// news title it supports
pub fn evidence_quality(title: &str, text: &str) -> f64 {
    // Authority (0-3): +0.5 per authority keyword
    let authority = (AUTHORITY_KEYWORDS.iter().filter(|kw| text.contains(**kw)).count() as f64
        * 0.5)
        .min(3.0);

    // Relevance (0-2): +0.4 per top-5 title token present
    let tokens = title_tokens(title);
    let relevance =
        (tokens.iter().filter(|t| text.contains(t.as_str())).count() as f64 * 0.4).min(2.0);

    // Info density (0-2): +0.3 per info keyword
    let density =
        (INFO_KEYWORDS.iter().filter(|kw| text.contains(**kw)).count() as f64 * 0.3).min(2.0);

    // Freshness (0-2): +0.4 per time keyword
    let freshness =
        (TIME_KEYWORDS.iter().filter(|kw| text.contains(**kw)).count() as f64 * 0.4).min(2.0);

    // Length sanity (0-1)
    let len = text.chars().count();
    let length = if (100..=2000).contains(&len) {
        1.0
    } else if (50..100).contains(&len) || (2001..=5000).contains(&len) {
        0.5
    } else {
        0.1
    };

    authority + relevance + density + freshness + length
}

/// Top-5 tokens of a title: CJK runs and ASCII words
fn title_tokens(title: &str) -> Vec<String> {
    TITLE_TOKEN
        .find_iter(title)
        .map(|m| m.as_str().to_string())
        .take(5)
        .collect()
}

/// Keep the best `max_kept` evidences (by quality, descending) and
/// concatenate them with excerpts capped at 200 characters each.
pub fn render_evidence_summary(evidences: &[Evidence], max_kept: usize) -> String {
    if evidences.is_empty() {
        return "未获取到有效背景信息".to_string();
    }

    let mut sorted: Vec<&Evidence> = evidences.iter().collect();
    sorted.sort_by(|a, b| b.quality.partial_cmp(&a.quality).unwrap_or(std::cmp::Ordering::Equal));

    sorted
        .iter()
        .take(max_kept.max(1))
        .map(|e| {
            format!("【搜索: {} | 质量: {:.1}】{}", e.query, e.quality, truncate_chars(&e.text, 200))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trim boilerplate prefixes and enforce the report length cap
pub fn clean_report(response: &str, max_length: usize) -> String {
    let mut report = response.trim().to_string();
    for prefix in REPORT_PREFIXES {
        if let Some(stripped) = report.strip_prefix(prefix) {
            report = stripped.trim().to_string();
            break;
        }
    }
    truncate_chars(&report, max_length)
}

/// Deterministic report used when synthesis fails
fn fallback_report(
    item: &NewsItem,
    evidence_summary: &str,
    executed: &[String],
    max_length: usize,
) -> String {
    let has_evidence = !evidence_summary.contains("未获取到有效背景信息");
    let mut report = format!(
        "基于新闻'{}'的深度分析：该新闻涉及{}等关键领域。",
        truncate_chars(&item.title, 40),
        executed.first().map(String::as_str).unwrap_or("财经"),
    );
    if has_evidence {
        report.push_str("结合相关背景信息，此事件可能对相关行业产生一定影响。");
    } else {
        report.push_str("由于背景信息有限，建议持续关注后续发展。");
    }
    report.push_str("投资者应关注相关政策动向和市场反应，谨慎评估投资风险。");
    truncate_chars(&report, max_length)
}

/// Additive importance adjustment from evidence quality, report
/// content, and evidence authority. Result clamped to [0, 100].
pub fn adjust_score(
    original: i32,
    evidences: &[Evidence],
    report: &str,
    evidence_summary: &str,
) -> i32 {
    let mut adjustment = 0i32;

    // Evidence-quality bonus (0-15)
    if !evidences.is_empty() {
        let avg = evidences.iter().map(|e| e.quality).sum::<f64>() / evidences.len() as f64;
        adjustment += if avg >= 7.0 {
            10
        } else if avg >= 5.0 {
            6
        } else if avg >= 3.0 {
            3
        } else {
            0
        };

        if evidences.len() >= 3 {
            adjustment += 3;
        } else if evidences.len() >= 2 {
            adjustment += 2;
        }
    }

    // Report-content bonus (0-10)
    let high_impact =
        (HIGH_IMPACT_KEYWORDS.iter().filter(|kw| report.contains(**kw)).count() as i32 * 2).min(6);
    let market =
        (MARKET_KEYWORDS.iter().filter(|kw| report.contains(**kw)).count() as i32).min(4);
    adjustment += high_impact + market;

    // Evidence-authority bonus (0-5)
    let authority = (AUTHORITY_KEYWORDS
        .iter()
        .filter(|kw| evidence_summary.contains(**kw))
        .count() as i32)
        .min(5);
    adjustment += authority;

    clamp_score_i32(original + adjustment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(quality: f64) -> Evidence {
        Evidence { query: "q".into(), text: "t".into(), quality }
    }

    #[test]
    fn query_plan_parses_numbered_lists() {
        let response = "1. 央行降准 影响\n2、银行板块 流动性\n3）货币政策 解读\n说明：以上为查询词";
        let queries = parse_query_plan(response);
        assert_eq!(
            queries,
            vec!["央行降准 影响", "银行板块 流动性", "货币政策 解读"]
        );
    }

    #[test]
    fn query_plan_dedupes_and_caps_at_three() {
        let response = "1. 相同查询\n2. 相同查询\n3. 查询B\n4. 查询C\n5. 查询D";
        let queries = parse_query_plan(response);
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0], "相同查询");
    }

    #[test]
    fn empty_plan_yields_nothing() {
        assert!(parse_query_plan("抱歉，无法给出查询。").is_empty());
    }

    #[test]
    fn evidence_quality_rewards_authority_and_freshness() {
        let rich = format!(
            "央行 证监会 官方 数据 报告 统计 最新 今日 近期 {}",
            "内容".repeat(100)
        );
        let poor = "无关紧要的短文本";

        let rich_score = evidence_quality("央行 降准", &rich);
        let poor_score = evidence_quality("央行 降准", poor);

        assert!(rich_score > poor_score);
        assert!(rich_score <= 10.0);
        assert!(poor_score >= 0.1);
    }

    #[test]
    fn evidence_length_bands() {
        let in_band = "字".repeat(500);
        let half_band = "字".repeat(3000);
        let out_of_band = "字".repeat(9000);

        // Only the length component differs between these three
        let base = |text: &str| evidence_quality("无匹配", text);
        assert!((base(&in_band) - 1.0).abs() < 1e-9);
        assert!((base(&half_band) - 0.5).abs() < 1e-9);
        assert!((base(&out_of_band) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn summary_keeps_top_evidence_in_quality_order() {
        let evidences = vec![
            Evidence { query: "低".into(), text: "低质量".into(), quality: 2.0 },
            Evidence { query: "高".into(), text: "高质量".into(), quality: 8.0 },
            Evidence { query: "中".into(), text: "中质量".into(), quality: 5.0 },
        ];
        let summary = render_evidence_summary(&evidences, 2);
        let high_pos = summary.find("高质量").unwrap();
        let mid_pos = summary.find("中质量").unwrap();
        assert!(high_pos < mid_pos);
        assert!(!summary.contains("低质量"));
    }

    #[test]
    fn excerpts_are_capped_at_200_chars() {
        let evidences =
            vec![Evidence { query: "q".into(), text: "长".repeat(500), quality: 5.0 }];
        let summary = render_evidence_summary(&evidences, 5);
        assert!(summary.chars().count() < 260);
    }

    #[test]
    fn report_prefixes_are_stripped_and_length_enforced() {
        let report = clean_report("深度分析报告：本次降准释放流动性约一万亿元。", 200);
        assert!(report.starts_with("本次降准"));

        let long = clean_report(&"析".repeat(400), 200);
        assert_eq!(long.chars().count(), 200);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn adjustment_bonuses_accumulate_and_clamp() {
        // avg 8 (>=7 -> +10), 3 evidences (+3)
        let evidences = vec![evidence(8.0), evidence(8.0), evidence(8.0)];
        let report = "重大 突破 显著 股市 市场 投资 资金";
        let summary = "央行 证监会 财政部 国务院 发改委 监管";

        let adjusted = adjust_score(85, &evidences, report, summary);
        // 85 + 10 + 3 + 6 (high-impact cap) + 4 (market cap) + 5 (authority cap) = 113 -> 100
        assert_eq!(adjusted, 100);

        let adjusted = adjust_score(40, &evidences, report, summary);
        assert_eq!(adjusted, 68);
    }

    #[test]
    fn no_evidence_means_no_quality_bonus() {
        let adjusted = adjust_score(80, &[], "无关键词报告", "无权威摘要");
        assert_eq!(adjusted, 80);
    }

    #[test]
    fn two_evidences_earn_the_smaller_count_bonus() {
        let evidences = vec![evidence(5.0), evidence(5.0)];
        // +6 (avg>=5) +2 (count>=2)
        let adjusted = adjust_score(70, &evidences, "", "");
        assert_eq!(adjusted, 78);
    }
}
