use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub news_collection: NewsCollectionConfig,
    pub ai_analysis: AiAnalysisConfig,
    pub email: EmailConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

// ============================================================================
// News collection
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NewsCollectionConfig {
    pub sources: SourcesConfig,
    /// Collection interval in minutes (simple strategy)
    pub collection_interval: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SourcesConfig {
    pub rss_feeds: Vec<RssFeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RssFeedConfig {
    pub name: String,
    pub url: String,
    pub max_items: usize,
    pub enabled: bool,
}

impl Default for RssFeedConfig {
    fn default() -> Self {
        Self {
            name: "ChinaNews".to_string(),
            url: "https://www.chinanews.com.cn/rss/finance.xml".to_string(),
            max_items: 50,
            enabled: true,
        }
    }
}

impl Default for NewsCollectionConfig {
    fn default() -> Self {
        Self {
            sources: SourcesConfig { rss_feeds: vec![RssFeedConfig::default()] },
            collection_interval: 30,
        }
    }
}

// ============================================================================
// AI analysis
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiAnalysisConfig {
    /// Active provider profile: "openrouter" or "deepseek"
    pub provider: String,
    pub openrouter: ProviderConfig,
    pub deepseek: ProviderConfig,
    pub analysis_params: AnalysisParams,
    pub deep_analysis: DeepAnalysisConfig,
}

impl Default for AiAnalysisConfig {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            openrouter: ProviderConfig {
                api_key: String::new(),
                base_url: "https://openrouter.ai/api/v1".to_string(),
                model: "deepseek/deepseek-r1-0528:free".to_string(),
                fallback_model: String::new(),
                max_tokens: 2000,
                temperature: 0.1,
            },
            deepseek: ProviderConfig {
                api_key: String::new(),
                base_url: "https://api.deepseek.com/v1".to_string(),
                model: "deepseek-chat".to_string(),
                fallback_model: "deepseek-chat".to_string(),
                max_tokens: 2000,
                temperature: 0.1,
            },
            analysis_params: AnalysisParams::default(),
            deep_analysis: DeepAnalysisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub fallback_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// Items per sub-batch during batch analysis
    pub batch_size: usize,
    /// Maximum in-flight LLM requests
    pub max_concurrent: usize,
    /// Per-request timeout in seconds (batch calls)
    pub timeout: u64,
    /// Timeout in seconds for the fallback-model attempt
    pub fallback_timeout: u64,
    /// Total HTTP attempts before the fallback model is tried
    pub retry_count: u32,
    /// Global LLM request cap per 60-second sliding window
    pub rate_limit: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent: 10,
            timeout: 30,
            fallback_timeout: 600,
            retry_count: 3,
            rate_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeepAnalysisConfig {
    pub enabled: bool,
    /// Minimum importance score that triggers deep analysis
    pub score_threshold: i32,
    pub max_concurrent: usize,
    pub max_search_keywords: usize,
    pub report_max_length: usize,
    pub enable_score_adjustment: bool,
    pub search_retry_count: u32,
    pub max_search_rounds: usize,
    /// Successful searches after which the query loop stops early
    pub evidence_threshold: usize,
    pub max_evidence_kept: usize,
    pub max_tokens: u32,
}

impl Default for DeepAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            score_threshold: 70,
            max_concurrent: 3,
            max_search_keywords: 5,
            report_max_length: 200,
            enable_score_adjustment: true,
            search_retry_count: 2,
            max_search_rounds: 3,
            evidence_threshold: 2,
            max_evidence_kept: 5,
            max_tokens: 2000,
        }
    }
}

// ============================================================================
// Email
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp: SmtpConfig,
    pub recipients: Vec<String>,
    pub template: EmailTemplateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub use_ssl: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 465,
            username: String::new(),
            password: String::new(),
            use_tls: false,
            use_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailTemplateConfig {
    pub subject: String,
    pub from_name: String,
}

impl Default for EmailTemplateConfig {
    fn default() -> Self {
        Self { subject: "财经新闻分析报告".to_string(), from_name: "Finsight".to_string() }
    }
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        !self.smtp.server.is_empty()
            && !self.smtp.username.is_empty()
            && !self.recipients.is_empty()
    }
}

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub sqlite: SqliteConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub db_path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { db_path: "data/news.db".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_days: 30 }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// "enhanced" runs the calendar strategy set; "simple" runs one
    /// full-pipeline interval job
    pub mode: String,
    /// Interval in minutes for the simple full-pipeline job
    pub pipeline_interval: u64,
    pub strategy: StrategyConfig,
    pub state_file: String,
    pub monitor_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: "enhanced".to_string(),
            pipeline_interval: 120,
            strategy: StrategyConfig::default(),
            state_file: "data/scheduler_state.json".to_string(),
            monitor_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StrategyConfig {
    pub morning_collection: CalendarJobConfig,
    pub trading_hours: IntervalJobConfig,
    pub evening_collection: EveningJobConfig,
    pub daily_summary: SummaryJobConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarJobConfig {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
}

impl Default for CalendarJobConfig {
    fn default() -> Self {
        Self { enabled: true, hour: 8, minute: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalJobConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for IntervalJobConfig {
    fn default() -> Self {
        Self { enabled: true, interval_minutes: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EveningJobConfig {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
}

impl Default for EveningJobConfig {
    fn default() -> Self {
        Self { enabled: true, hour: 22, minute: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryJobConfig {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
}

impl Default for SummaryJobConfig {
    fn default() -> Self {
        Self { enabled: true, hour: 23, minute: 30 }
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,finsight=debug".to_string(),
            file: Some("data/logs/finsight.log".to_string()),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("invalid placeholder regex"));

impl Config {
    /// Load configuration with file and environment variable support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Environment variables (prefixed with APP_)
    /// 2. Configuration file (config.toml) with `${VAR}` substitution
    /// 3. Default values
    pub fn load(config_path: Option<&str>) -> Result<Self, anyhow::Error> {
        let config_path = config_path
            .map(|p| p.to_string())
            .or_else(Self::find_config_file);

        let mut config = if let Some(path) = config_path {
            Self::from_toml(&path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_DB_PATH: SQLite database path (default: data/news.db)
    /// - APP_LOG_LEVEL: Logging level (e.g., "info,finsight=debug")
    /// - APP_STATE_FILE: Scheduler state file path
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("APP_DB_PATH") {
            self.database.sqlite.db_path = path;
            tracing::info!("Override database.sqlite.db_path from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(state_file) = std::env::var("APP_STATE_FILE") {
            self.scheduler.state_file = state_file;
            tracing::info!("Override scheduler.state_file from env");
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.database.sqlite.db_path.is_empty() {
            anyhow::bail!("database.sqlite.db_path cannot be empty");
        }

        if self.database.retention.max_days <= 0 {
            anyhow::bail!("database.retention.max_days must be > 0");
        }

        if self.news_collection.collection_interval == 0 {
            anyhow::bail!("news_collection.collection_interval must be > 0");
        }

        let threshold = self.ai_analysis.deep_analysis.score_threshold;
        if !(0..=100).contains(&threshold) {
            anyhow::bail!("ai_analysis.deep_analysis.score_threshold must be in [0, 100]");
        }

        match self.ai_analysis.provider.as_str() {
            "openrouter" | "deepseek" => {},
            other => anyhow::bail!("unknown ai_analysis.provider: {}", other),
        }

        if self.email.is_configured() && self.email.smtp.port == 0 {
            anyhow::bail!("email.smtp.port cannot be 0");
        }

        if self.scheduler.mode != "enhanced" && self.scheduler.mode != "simple" {
            anyhow::bail!("scheduler.mode must be 'enhanced' or 'simple'");
        }

        Ok(())
    }

    /// Active provider section according to `ai_analysis.provider`
    pub fn active_provider(&self) -> &ProviderConfig {
        match self.ai_analysis.provider.as_str() {
            "openrouter" => &self.ai_analysis.openrouter,
            _ => &self.ai_analysis.deepseek,
        }
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let content = resolve_env_placeholders(&content);
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Substitute `${NAME}` placeholders from the process environment.
/// Unknown variables are left as-is so misconfiguration stays visible.
fn resolve_env_placeholders(content: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(content, |caps: &regex::Captures| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
