use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ppof_adapters::{Endpoints, MAX_LISTING_PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Which items get an award lookup. Only items whose listing payload carries the
/// has-result indicator are ever considered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardScope {
    #[default]
    RelevantItems,
    AllFlaggedItems,
    Disabled,
}

impl AwardScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relevant" | "relevant_items" => Some(Self::RelevantItems),
            "all" | "all_flagged_items" => Some(Self::AllFlaggedItems),
            "none" | "disabled" | "off" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub url: String,
    pub token: Option<String>,
    pub requests_per_second: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_requests_per_minute: u32,
    pub batch_size: usize,
    pub max_listing_pages: u32,
    pub max_item_pages: u32,
    pub listing_page_size: u32,
    pub api_token: Option<String>,
    pub endpoints: Endpoints,
    pub vocabulary_path: PathBuf,
    pub reports_dir: PathBuf,
    pub award_scope: AwardScope,
    pub min_value: f64,
    pub max_value: Option<f64>,
    pub dashboard: Option<DashboardConfig>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub schedule_lookback_days: u32,
    pub run_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Endpoints::default();

        Self {
            database_url: get("DATABASE_URL"),
            user_agent: get("PPOF_USER_AGENT").unwrap_or_else(|| "ppof-bot/0.1".to_string()),
            http_timeout_secs: parsed(get("PPOF_HTTP_TIMEOUT_SECS")).unwrap_or(30),
            max_requests_per_minute: parsed(get("PPOF_MAX_REQUESTS_PER_MINUTE")).unwrap_or(60),
            batch_size: parsed::<usize>(get("PPOF_BATCH_SIZE")).unwrap_or(5).max(1),
            max_listing_pages: parsed(get("PPOF_MAX_LISTING_PAGES")).unwrap_or(100),
            max_item_pages: parsed(get("PPOF_MAX_ITEM_PAGES")).unwrap_or(20),
            listing_page_size: parsed(get("PPOF_LISTING_PAGE_SIZE")).unwrap_or(MAX_LISTING_PAGE_SIZE),
            api_token: get("PPOF_API_TOKEN"),
            endpoints: Endpoints {
                listing_base: get("PPOF_LISTING_BASE_URL").unwrap_or(defaults.listing_base),
                items_base: get("PPOF_ITEMS_BASE_URL").unwrap_or(defaults.items_base),
                results_base: get("PPOF_RESULTS_BASE_URL").unwrap_or(defaults.results_base),
            },
            vocabulary_path: get("PPOF_VOCABULARY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("vocabulary.yaml")),
            reports_dir: get("PPOF_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            award_scope: get("PPOF_AWARD_SCOPE")
                .and_then(|v| AwardScope::parse(&v))
                .unwrap_or_default(),
            min_value: parsed(get("PPOF_MIN_VALUE")).unwrap_or(0.0),
            max_value: parsed(get("PPOF_MAX_VALUE")),
            dashboard: get("PPOF_DASHBOARD_URL").map(|url| DashboardConfig {
                url,
                token: get("PPOF_DASHBOARD_TOKEN"),
                requests_per_second: parsed(get("PPOF_DASHBOARD_REQUESTS_PER_SECOND")).unwrap_or(3),
            }),
            scheduler_enabled: get("PPOF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("PPOF_SYNC_CRON").unwrap_or_else(|| "0 6 * * *".to_string()),
            schedule_lookback_days: parsed(get("PPOF_SCHEDULE_LOOKBACK_DAYS")).unwrap_or(1),
            run_timeout: parsed::<u64>(get("PPOF_RUN_TIMEOUT_SECS")).map(Duration::from_secs),
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

/// Comma-separated list, trimmed, empties dropped.
pub fn parse_list<T: FromStr>(raw: &str) -> Result<Vec<T>, T::Err> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
