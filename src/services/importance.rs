//! Importance Scorer - rates market importance of one news item
//!
//! Sends a fixed Chinese prompt asking for strict JSON and recovers
//! leniently: first balanced `{…}` substring, then regex score
//! extraction, then a 50-point sentinel.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{NewsItem, clamp_score_i32};
use crate::services::llm::{ChatCompletion, ChatOptions};
use crate::utils::truncate_chars;

const MAX_KEY_FACTORS: usize = 5;

/// Importance assessment for one news item
#[derive(Debug, Clone)]
pub struct ImportanceAssessment {
    pub score: i32,
    pub reasoning: String,
    pub key_factors: Vec<String>,
    pub model_used: String,
}

#[derive(Debug, Deserialize)]
struct ImportanceResponse {
    #[serde(default, deserialize_with = "lenient_score")]
    importance_score: Option<i32>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    key_factors: Vec<String>,
}

/// Accept the score as an integer, float, or numeric string
fn lenient_score<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|v| v as i32)
            .or_else(|| n.as_f64().map(|v| v.round() as i32)),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(|v| v.round() as i32),
        _ => None,
    })
}

static SCORE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(\d+)分",
        r"评分[：:]\s*(\d+)",
        r"重要程度[：:]\s*(\d+)",
        r"分数[：:]\s*(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid score pattern"))
    .collect()
});

/// News importance scorer backed by the LLM client
pub struct ImportanceScorer {
    llm: Arc<dyn ChatCompletion>,
    timeout: Duration,
}

impl ImportanceScorer {
    pub fn new(llm: Arc<dyn ChatCompletion>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Score one item in [0, 100] with reasoning and up to 5 key factors.
    /// Never fails: client and parse errors degrade to the 50-point
    /// sentinel.
    pub async fn score(&self, item: &NewsItem) -> ImportanceAssessment {
        let prompt = build_importance_prompt(item);
        let opts = ChatOptions::with_timeout(self.timeout);

        match self.llm.chat(&prompt, &opts).await {
            Ok(response) => {
                let mut assessment = parse_importance_response(&response);
                assessment.model_used = self.llm.model_name();
                tracing::info!(
                    "Importance scored: {}... -> {}",
                    truncate_chars(&item.title, 30),
                    assessment.score
                );
                assessment
            },
            Err(e) => {
                tracing::error!("Importance scoring failed for '{}': {}", item.title, e);
                ImportanceAssessment {
                    score: 50,
                    reasoning: "由于API调用失败，使用默认评分".to_string(),
                    key_factors: vec!["API错误".to_string(), "默认评分".to_string()],
                    model_used: self.llm.model_name(),
                }
            },
        }
    }
}

fn build_importance_prompt(item: &NewsItem) -> String {
    format!(
        r#"请分析以下财经新闻的重要程度，并给出0-100分的评分。

新闻信息：
- 标题：{title}
- 内容：{content}
- 来源：{source}
- 分类：{category}
- 发布时间：{publish_time}

评分标准：
- 90-100分：极其重要，可能引发市场剧烈波动的重大事件
- 80-89分：很重要，对市场有显著影响的重要消息
- 70-79分：重要，对相关行业或板块有明显影响
- 60-69分：中等重要，有一定市场关注度
- 40-59分：一般重要，日常性财经新闻
- 20-39分：较低重要，影响有限的消息
- 0-19分：不重要，几乎无市场影响

请深入思考并分析：
1. 这条新闻涉及哪些关键要素？
2. 对股市、行业、经济的潜在影响有多大？
3. 新闻的时效性和权威性如何？
4. 是否涉及政策、监管、重大事件？
5. 对投资者决策的参考价值有多高？

请以JSON格式返回分析结果：
{{
    "importance_score": 分数(0-100整数),
    "reasoning": "详细的分析推理过程",
    "key_factors": ["影响重要程度的关键因素1", "关键因素2", "关键因素3"]
}}"#,
        title = item.title,
        content = item.content,
        source = item.source,
        category = item.category,
        publish_time = item.publish_time.to_rfc3339(),
    )
}

/// Parse the model output: balanced-JSON first, regex recovery second,
/// 50-point sentinel last.
pub fn parse_importance_response(response: &str) -> ImportanceAssessment {
    if let Some(json_str) = extract_balanced_json(response) {
        if let Ok(parsed) = serde_json::from_str::<ImportanceResponse>(&json_str) {
            if let Some(score) = parsed.importance_score {
                let mut key_factors = parsed.key_factors;
                key_factors.truncate(MAX_KEY_FACTORS);
                if key_factors.is_empty() {
                    key_factors.push("未识别关键因素".to_string());
                }
                let reasoning = if parsed.reasoning.is_empty() {
                    "AI分析过程".to_string()
                } else {
                    parsed.reasoning
                };
                return ImportanceAssessment {
                    score: clamp_score_i32(score),
                    reasoning,
                    key_factors,
                    model_used: String::new(),
                };
            }
        }
    }

    parse_text_response(response)
}

/// Regex-based score recovery over free text
fn parse_text_response(response: &str) -> ImportanceAssessment {
    for pattern in SCORE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(response) {
            if let Ok(score) = caps[1].parse::<i32>() {
                if (0..=100).contains(&score) {
                    return ImportanceAssessment {
                        score,
                        reasoning: truncate_chars(response, 500),
                        key_factors: vec!["AI文本分析".to_string()],
                        model_used: String::new(),
                    };
                }
            }
        }
    }

    ImportanceAssessment {
        score: 50,
        reasoning: "解析失败".to_string(),
        key_factors: vec!["解析失败".to_string(), "默认评分".to_string()],
        model_used: String::new(),
    }
}

/// Extract the first balanced `{…}` substring from the response
pub fn extract_balanced_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            },
            _ => {},
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let response = r#"根据分析，结果如下：
{"importance_score": 85, "reasoning": "央行政策重大调整", "key_factors": ["货币政策", "流动性", "银行板块"]}"#;
        let assessment = parse_importance_response(response);
        assert_eq!(assessment.score, 85);
        assert_eq!(assessment.reasoning, "央行政策重大调整");
        assert_eq!(assessment.key_factors.len(), 3);
    }

    #[test]
    fn score_is_clamped_and_factors_truncated() {
        let response = r#"{"importance_score": 150, "reasoning": "r",
            "key_factors": ["1","2","3","4","5","6","7"]}"#;
        let assessment = parse_importance_response(response);
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.key_factors.len(), 5);
    }

    #[test]
    fn float_and_string_scores_are_accepted() {
        let assessment = parse_importance_response(r#"{"importance_score": 72.6}"#);
        assert_eq!(assessment.score, 73);

        let assessment = parse_importance_response(r#"{"importance_score": "64"}"#);
        assert_eq!(assessment.score, 64);
    }

    #[test]
    fn regex_recovery_from_plain_text() {
        let assessment = parse_importance_response("这条新闻的重要程度评分：78，值得关注。");
        assert_eq!(assessment.score, 78);
        assert_eq!(assessment.key_factors, vec!["AI文本分析".to_string()]);

        let assessment = parse_importance_response("综合评估为65分。");
        assert_eq!(assessment.score, 65);
    }

    #[test]
    fn unparseable_text_falls_back_to_sentinel() {
        let assessment = parse_importance_response("模型没有给出任何数字结论。");
        assert_eq!(assessment.score, 50);
        assert_eq!(assessment.reasoning, "解析失败");
    }

    #[test]
    fn balanced_extraction_handles_nesting_and_strings() {
        let text = r#"prefix {"a": {"b": 1}, "c": "has } brace"} suffix"#;
        let json = extract_balanced_json(text).unwrap();
        assert_eq!(json, r#"{"a": {"b": 1}, "c": "has } brace"}"#);

        assert!(extract_balanced_json("no braces here").is_none());
    }
}
