//! Email Composer - HTML reports and SMTP dispatch
//!
//! Rendering is pure (unit-testable); dispatch goes through lettre with
//! SSL (465) or STARTTLS (587) per configuration.

use chrono::{DateTime, Local};
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;
use crate::models::{AnalysisResult, NewsItem};
use crate::services::store::StoreStats;
use crate::utils::truncate_chars;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Email not configured")]
    NotConfigured,
}

/// One renderable row: a news item with its latest impact analysis
#[derive(Debug, Clone)]
pub struct ReportItem {
    pub news: NewsItem,
    pub analysis: Option<AnalysisResult>,
}

impl ReportItem {
    fn impact_score(&self) -> f64 {
        self.analysis.as_ref().map(|a| a.impact_score).unwrap_or(0.0)
    }

    fn summary(&self) -> &str {
        self.analysis
            .as_ref()
            .map(|a| a.summary.as_str())
            .unwrap_or("暂无AI摘要")
    }
}

// ============================================================================
// Rendering
// ============================================================================

const STYLE: &str = r#"
        body { font-family: 'Microsoft YaHei', Arial, sans-serif; line-height: 1.6; color: #333; background: #f5f5f5; margin: 0; }
        .container { max-width: 800px; margin: 0 auto; background: white; padding: 20px; }
        .header { background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; padding: 24px; border-radius: 10px; text-align: center; }
        .stats { display: flex; justify-content: space-around; margin: 24px 0; }
        .stat-card { text-align: center; padding: 16px; background: #f8f9fa; border-radius: 8px; flex: 1; margin: 0 8px; }
        .stat-number { font-size: 2em; font-weight: bold; color: #667eea; }
        .news-section { margin: 24px 0; }
        .section-title { font-size: 1.4em; color: #333; border-bottom: 2px solid #667eea; padding-bottom: 8px; margin-bottom: 16px; }
        .news-item { margin: 14px 0; padding: 14px; border-left: 4px solid #667eea; border-radius: 8px; background: #f8f9fa; }
        .news-title { font-weight: bold; color: #333; margin-bottom: 6px; }
        .meta { font-size: 0.9em; color: #777; margin: 6px 0; }
        .badge { display: inline-block; padding: 3px 10px; border-radius: 15px; font-size: 0.85em; font-weight: bold; color: white; margin-right: 6px; }
        .badge-high { background: #e74c3c; }
        .badge-medium { background: #f39c12; }
        .badge-low { background: #27ae60; }
        .summary { color: #555; margin: 8px 0; }
        .excerpt { color: #666; font-size: 0.95em; }
        .footer { text-align: center; margin-top: 32px; padding-top: 16px; border-top: 1px solid #ddd; color: #999; font-size: 0.85em; }
        @media (max-width: 480px) {
            .container { padding: 8px; }
            .header { padding: 14px; font-size: 0.9em; }
            .stats { flex-direction: column; }
            .stat-card { margin: 4px 0; }
            .news-item { padding: 8px; }
        }
"#;

const DISCLAIMER: &str = "本报告由AI新闻分析系统自动生成，仅供参考，不构成投资建议。";

fn importance_badge(score: i32) -> (&'static str, &'static str) {
    if score >= 80 {
        ("badge-high", "高")
    } else if score >= 50 {
        ("badge-medium", "中")
    } else {
        ("badge-low", "低")
    }
}

fn impact_badge(score: f64) -> &'static str {
    if score.abs() > 10.0 { "badge-high" } else { "badge-low" }
}

fn render_item(item: &ReportItem) -> String {
    let (importance_class, importance_label) = importance_badge(item.news.importance_score);
    let impact_class = impact_badge(item.impact_score());

    format!(
        r#"            <div class="news-item">
                <div class="news-title">{title}</div>
                <div class="meta">
                    <span class="badge {impact_class}">影响 {impact:.1}</span>
                    <span class="badge {importance_class}">重要性 {importance} ({importance_label})</span>
                    来源: {source} | {time}
                </div>
                <div class="summary"><strong>AI摘要:</strong> {summary}</div>
                <div class="excerpt">{excerpt}</div>
            </div>
"#,
        title = item.news.title,
        impact_class = impact_class,
        impact = item.impact_score(),
        importance_class = importance_class,
        importance = item.news.importance_score,
        importance_label = importance_label,
        source = item.news.source,
        time = item.news.publish_time.with_timezone(&Local).format("%-m-%-d %-H:%M"),
        summary = item.summary(),
        excerpt = truncate_chars(&item.news.content, 200),
    )
}

/// Render the analysis report used by the morning digest and intraday
/// dispatches.
pub fn render_report(items: &[ReportItem], title: &str, generated_at: DateTime<Local>) -> String {
    let total = items.len();
    let positive = items.iter().filter(|i| i.impact_score() > 5.0).count();
    let negative = items.iter().filter(|i| i.impact_score() < -5.0).count();
    let neutral = total - positive - negative;

    let high_importance = items.iter().filter(|i| i.news.importance_score >= 80).count();
    let medium_importance = items
        .iter()
        .filter(|i| (50..80).contains(&i.news.importance_score))
        .count();
    let low_importance = items.iter().filter(|i| i.news.importance_score < 50).count();

    let mut sorted: Vec<&ReportItem> = items.iter().collect();
    sorted.sort_by(|a, b| {
        b.impact_score()
            .abs()
            .partial_cmp(&a.impact_score().abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let high_impact: Vec<&&ReportItem> = sorted
        .iter()
        .filter(|i| i.impact_score().abs() > 10.0)
        .take(5)
        .collect();

    let mut html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>{style}</style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>📰 {title}</h1>
            <p>生成时间: {generated}</p>
            <p>新闻数量: {total} 条</p>
        </div>
        <div class="stats">
            <div class="stat-card"><div class="stat-number">{total}</div><div>总新闻数</div></div>
            <div class="stat-card"><div class="stat-number">{positive}</div><div>正面 / {negative} 负面 / {neutral} 中性</div></div>
            <div class="stat-card"><div class="stat-number">{high_importance}</div><div>高重要性 / {medium_importance} 中 / {low_importance} 低</div></div>
        </div>
"#,
        style = STYLE,
        title = title,
        generated = generated_at.format("%Y年%m月%d日 %H:%M"),
        total = total,
        positive = positive,
        negative = negative,
        neutral = neutral,
        high_importance = high_importance,
        medium_importance = medium_importance,
        low_importance = low_importance,
    );

    if !high_impact.is_empty() {
        html.push_str(
            "        <div class=\"news-section\">\n            <h2 class=\"section-title\">🔴 高影响新闻</h2>\n",
        );
        for item in &high_impact {
            html.push_str(&render_item(item));
        }
        html.push_str("        </div>\n");
    }

    html.push_str(
        "        <div class=\"news-section\">\n            <h2 class=\"section-title\">📋 全部新闻</h2>\n",
    );
    for item in &sorted {
        html.push_str(&render_item(item));
    }
    html.push_str("        </div>\n");

    html.push_str(&format!(
        r#"        <div class="footer">
            <p>{disclaimer}</p>
            <p>生成时间: {generated}</p>
        </div>
    </div>
</body>
</html>
"#,
        disclaimer = DISCLAIMER,
        generated = generated_at.format("%Y-%m-%d %H:%M:%S"),
    ));

    html
}

/// Render the end-of-day summary over the whole day's activity
pub fn render_daily_summary(
    items: &[ReportItem],
    stats: &StoreStats,
    generated_at: DateTime<Local>,
) -> String {
    let total = items.len();
    let high: Vec<&ReportItem> =
        items.iter().filter(|i| i.news.importance_score >= 70).collect();
    let medium: Vec<&ReportItem> = items
        .iter()
        .filter(|i| (40..70).contains(&i.news.importance_score))
        .collect();
    let low_count = total - high.len() - medium.len();
    let avg_score = if total > 0 {
        items.iter().map(|i| i.news.importance_score as f64).sum::<f64>() / total as f64
    } else {
        0.0
    };

    let mut html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>{style}</style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>📊 每日新闻汇总报告</h1>
            <p style="font-size: 1.2em;">{date}</p>
        </div>
        <div class="stats">
            <div class="stat-card"><div class="stat-number">{total}</div><div>今日新闻</div></div>
            <div class="stat-card"><div class="stat-number">{avg:.1}</div><div>平均重要性</div></div>
            <div class="stat-card"><div class="stat-number">{high_count}</div><div>高重要性新闻</div></div>
            <div class="stat-card"><div class="stat-number">{store_total}</div><div>库内总量</div></div>
        </div>
"#,
        style = STYLE,
        date = generated_at.format("%Y年%m月%d日"),
        total = total,
        avg = avg_score,
        high_count = high.len(),
        store_total = stats.total,
    );

    if !high.is_empty() {
        html.push_str(
            "        <div class=\"news-section\">\n            <h2 class=\"section-title\">🔴 高重要性新闻</h2>\n",
        );
        for item in high.iter().take(10) {
            html.push_str(&render_item(item));
        }
        html.push_str("        </div>\n");
    }

    if !medium.is_empty() {
        html.push_str(
            "        <div class=\"news-section\">\n            <h2 class=\"section-title\">🟡 中等重要性新闻</h2>\n",
        );
        for item in medium.iter().take(10) {
            html.push_str(&render_item(item));
        }
        html.push_str("        </div>\n");
    }

    if low_count > 0 {
        html.push_str(&format!(
            "        <div class=\"news-section\">\n            <h2 class=\"section-title\">🟢 其他新闻</h2>\n            <p>今日还有 {} 条低重要性新闻，主要涉及日常市场动态和公司公告。</p>\n        </div>\n",
            low_count
        ));
    }

    html.push_str(&format!(
        r#"        <div class="footer">
            <p>{disclaimer}</p>
            <p>生成时间: {generated}</p>
        </div>
    </div>
</body>
</html>
"#,
        disclaimer = DISCLAIMER,
        generated = generated_at.format("%Y-%m-%d %H:%M:%S"),
    ));

    html
}

/// Subject line for instant dispatches
pub fn instant_subject(prefix: &str, at: DateTime<Local>) -> String {
    format!("📰 {} - {}", prefix, at.format("%H:%M"))
}

/// Subject line for the daily summary
pub fn summary_subject(at: DateTime<Local>) -> String {
    format!("📊 每日新闻汇总 - {}", at.format("%Y年%m月%d日"))
}

/// Plain-text alternative part for clients without HTML rendering
fn render_plain(items: &[ReportItem], title: &str) -> String {
    let mut text = format!("{}\n\n", title);
    for item in items {
        text.push_str(&format!(
            "- [{}分] {} ({})\n",
            item.news.importance_score, item.news.title, item.news.source
        ));
    }
    text.push_str(&format!("\n{}\n", DISCLAIMER));
    text
}

// ============================================================================
// Sender
// ============================================================================

/// SMTP dispatcher over lettre
pub struct EmailSender {
    config: EmailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Result<Self, EmailError> {
        if !config.is_configured() {
            return Err(EmailError::NotConfigured);
        }

        let credentials =
            Credentials::new(config.smtp.username.clone(), config.smtp.password.clone());

        // Port 465 wraps the whole session in TLS; 587 upgrades via
        // STARTTLS
        let builder = if config.smtp.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp.server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp.server)?
        };

        let transport = builder
            .port(config.smtp.port)
            .credentials(credentials)
            .build();

        Ok(Self { config, transport })
    }

    /// Send one HTML report to every configured recipient
    pub async fn send_report(
        &self,
        subject: &str,
        items: &[ReportItem],
        html: String,
    ) -> Result<(), EmailError> {
        let plain = render_plain(items, subject);

        for recipient in &self.config.recipients {
            let message = Message::builder()
                .from(
                    format!(
                        "{} <{}>",
                        self.config.template.from_name, self.config.smtp.username
                    )
                    .parse()?,
                )
                .to(recipient.parse()?)
                .subject(subject)
                .multipart(MultiPart::alternative_plain_html(plain.clone(), html.clone()))?;

            self.transport.send(message).await?;
            tracing::info!("Email sent to {}: {}", recipient, subject);
        }

        Ok(())
    }
}
