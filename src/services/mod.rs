pub mod collector;
pub mod deep;
pub mod email;
pub mod impact;
pub mod importance;
pub mod llm;
pub mod pipeline;
pub mod search;
pub mod store;

pub use collector::{FeedIngestor, NewsCollector, NewsSource};
pub use deep::DeepAnalyzer;
pub use email::{EmailError, EmailSender, ReportItem};
pub use impact::ImpactAnalyzer;
pub use importance::{ImportanceAssessment, ImportanceScorer};
pub use llm::{ChatCompletion, ChatOptions, LlmClient, LlmError, ProviderKind, ProviderProfile};
pub use pipeline::{CycleOutcome, PipelineOrchestrator};
pub use search::{BaiduSearchClient, WebSearch};
pub use store::{NewsQuery, NewsStore, StoreError, StoreStats};
