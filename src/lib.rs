//! Finsight Library
//!
//! Scheduled pipeline that collects financial news over RSS, scores it
//! with LLM providers, deep-analyzes high-importance items against web
//! evidence, persists everything in SQLite, and dispatches HTML email
//! reports.

pub mod config;
pub mod db;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use models::{AnalysisResult, DeepAnalysisResult, ImpactDegree, NewsItem, SchedulerState};
pub use scheduler::{LifecycleManager, Scheduler, Trigger};
pub use services::{
    BaiduSearchClient, ChatCompletion, DeepAnalyzer, EmailSender, ImpactAnalyzer,
    ImportanceScorer, LlmClient, NewsCollector, NewsStore, PipelineOrchestrator,
};
