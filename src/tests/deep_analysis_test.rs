//! Deep analyzer scenarios over the scripted LLM and search backends.

use std::sync::Arc;

use super::common::{MockChat, MockSearch, sample_item};
use crate::config::DeepAnalysisConfig;
use crate::services::deep::DeepAnalyzer;

fn analyzer(chat: Arc<MockChat>, search: Arc<MockSearch>) -> DeepAnalyzer {
    DeepAnalyzer::new(chat, search, DeepAnalysisConfig::default())
}

/// High-importance item with two of three queries succeeding: score
/// adjusted upward, report bounded, queries recorded.
#[tokio::test]
async fn high_importance_item_gets_adjusted_upward() {
    let chat = Arc::new(MockChat::default());
    let search = Arc::new(MockSearch::with_pattern(
        "央行官方发布权威数据报告，最新统计显示政策效果显著，近期市场流动性改善。",
        vec![false, true, true],
    ));

    let deep = analyzer(chat, Arc::clone(&search));
    let item = sample_item("央行宣布降准0.5个百分点", 85);

    let result = deep.analyze_deep(&item).await;

    assert!(result.search_success);
    assert_eq!(result.original_score, 85);
    assert!((85..=100).contains(&result.adjusted_score));
    assert!(result.search_keywords.len() >= 2);
    assert!(!result.deep_analysis_report.is_empty());
    assert!(result.deep_analysis_report.chars().count() <= 200);
    // The synthesized report had its boilerplate prefix stripped
    assert!(!result.deep_analysis_report.starts_with("分析报告"));
    assert_eq!(result.model_used, "mock-model");
}

/// Below the threshold nothing runs: sentinel result, score unchanged,
/// no LLM or search calls.
#[tokio::test]
async fn below_threshold_item_is_skipped_untouched() {
    let chat = Arc::new(MockChat::default());
    let search = Arc::new(MockSearch::always_ok("证据"));

    let deep = analyzer(Arc::clone(&chat), Arc::clone(&search));
    let item = sample_item("普通市场新闻", 40);

    let result = deep.analyze_deep(&item).await;

    assert_eq!(result.model_used, "skip");
    assert_eq!(result.adjusted_score, 40);
    assert!(!result.search_success);
    assert!(result.search_keywords.is_empty());
    assert_eq!(chat.call_count(), 0);
    assert_eq!(search.call_count(), 0);
}

/// The query loop stops as soon as the evidence threshold is met.
#[tokio::test]
async fn search_loop_stops_early_at_evidence_threshold() {
    // Three planned queries, every search succeeds; with
    // evidence_threshold=2 the third query must never execute
    let chat = Arc::new(MockChat {
        plan_response: "1. 查询一\n2. 查询二\n3. 查询三".to_string(),
        ..Default::default()
    });
    let search = Arc::new(MockSearch::always_ok("高质量证据内容"));

    let config = DeepAnalysisConfig { evidence_threshold: 2, ..Default::default() };
    let chat_dyn: Arc<dyn crate::services::llm::ChatCompletion> = chat.clone();
    let search_dyn: Arc<dyn crate::services::search::WebSearch> = search.clone();
    let deep = DeepAnalyzer::new(chat_dyn, search_dyn, config);

    let item = sample_item("提前停止测试新闻", 90);
    let result = deep.analyze_deep(&item).await;

    assert!(result.search_success);
    assert_eq!(search.call_count(), 2);
    assert_eq!(result.search_keywords, vec!["查询一", "查询二"]);
}

/// All searches fail: the loop completes with search_success=false and
/// the original score is preserved (no evidence, no adjustment).
#[tokio::test]
async fn failed_searches_leave_score_unchanged() {
    let chat = Arc::new(MockChat::default());
    let search = Arc::new(MockSearch::with_pattern("ignored", vec![false]));

    let deep = analyzer(chat, search);
    let item = sample_item("搜索失败场景", 80);

    let result = deep.analyze_deep(&item).await;

    assert!(!result.search_success);
    assert_eq!(result.adjusted_score, 80);
    assert!(result.search_results_summary.contains("未获取到有效背景信息"));
    // A report still exists (synthesized without evidence)
    assert!(!result.deep_analysis_report.is_empty());
}

/// Batch form: mixed thresholds produce per-item outcomes in input
/// order.
#[tokio::test]
async fn batch_preserves_order_and_mixes_outcomes() {
    let chat = Arc::new(MockChat::default());
    let search = Arc::new(MockSearch::always_ok("官方权威数据报告 最新"));

    let deep = Arc::new(analyzer(chat, search));
    let mut items = vec![
        sample_item("高分新闻", 90),
        sample_item("低分新闻", 30),
        sample_item("临界新闻", 70),
    ];
    for item in items.iter_mut() {
        item.ensure_id();
    }

    let results = deep.analyze_batch(&items).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].news_id, items[0].id);
    assert_ne!(results[0].model_used, "skip");
    assert_eq!(results[1].model_used, "skip");
    assert_ne!(results[2].model_used, "skip");
}
