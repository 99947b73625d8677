//! Discovery pipeline orchestration: vocabulary, classification, dedup, batching, reports.

pub mod classifier;
pub mod config;
pub mod export;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod vocabulary;

pub use classifier::{
    classifier_for, flag_items, Classification, ExhaustiveClassifier, ItemClassifier,
    SampledClassifier,
};
pub use config::{parse_list, AwardScope, DashboardConfig, SyncConfig};
pub use export::{dashboard_payload, item_key, DashboardSink, ExportError, HttpDashboardSink};
pub use pipeline::{
    open_store, DedupGate, DiscoveryPipeline, OpportunityDigest, PipelineOptions, RunPlan,
    RunSummary,
};
pub use report::{daily_brief, recent_runs_report, write_run_report};
pub use scheduler::{build_scheduler, scheduled_plan};
pub use vocabulary::{
    ClassificationPolicy, ContextualPhrase, KeywordHit, KeywordMatcher, Vocabulary,
    VocabularyError,
};

pub const CRATE_NAME: &str = "ppof-sync";
