//! Discovery run: listing walk, pre-filter, dedup gate, batched detail workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use futures::StreamExt;
use ppof_adapters::{
    fetch_all, parse_opportunity, DetailFetcher, ListingQuery, PncpClient, ProcurementApi,
    SourceError, ALL_STATE_CODES, DEFAULT_MODALITIES,
};
use ppof_core::{
    Item, Opportunity, ProcessingOutcome, ProcessingStage, SizeBucket,
};
use ppof_http::{BackoffPolicy, HttpClientConfig, HttpFetcher, RateLimiter};
use ppof_store::{MemoryStore, OpportunityStore, PgStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{classifier_for, Classification, ItemClassifier};
use crate::config::{AwardScope, SyncConfig};
use crate::export::{DashboardSink, HttpDashboardSink};
use crate::vocabulary::{KeywordMatcher, Vocabulary};

/// Which listing walks one run performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub states: Vec<String>,
    pub modalities: Vec<i32>,
    pub chunk_days: u32,
    pub discovery_only: bool,
    pub force: bool,
}

impl RunPlan {
    pub fn new(date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            date_from,
            date_to,
            states: ALL_STATE_CODES.iter().map(|s| s.to_string()).collect(),
            modalities: DEFAULT_MODALITIES.to_vec(),
            chunk_days: 7,
            discovery_only: false,
            force: false,
        }
    }

    /// Trailing window ending today, used by scheduled runs.
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        let from = today - chrono::Duration::days(i64::from(days));
        Self::new(from, today)
    }

    /// Inclusive `[from, to]` chunks of at most `chunk_days` days.
    pub fn date_chunks(&self) -> Vec<(NaiveDate, NaiveDate)> {
        let step = i64::from(self.chunk_days.max(1));
        let mut chunks = Vec::new();
        let mut start = self.date_from;
        while start <= self.date_to {
            let end = (start + chrono::Duration::days(step - 1)).min(self.date_to);
            chunks.push((start, end));
            start = end + chrono::Duration::days(1);
        }
        chunks
    }

    /// One listing query per chunk x state x modality.
    pub fn queries(&self, page_size: u32) -> Vec<ListingQuery> {
        let states: Vec<Option<String>> = if self.states.is_empty() {
            vec![None]
        } else {
            self.states.iter().cloned().map(Some).collect()
        };
        let mut out = Vec::new();
        for (from, to) in self.date_chunks() {
            for state in &states {
                for modality in &self.modalities {
                    let mut query = ListingQuery::new(from, to, *modality);
                    query.state_code = state.clone();
                    query.page_size = page_size;
                    out.push(query);
                }
            }
        }
        out
    }
}

/// Short view of one opportunity for the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDigest {
    pub control_number: String,
    pub title: String,
    pub organization: String,
    pub state_code: Option<String>,
    pub status: String,
    pub value: f64,
    pub size_bucket: SizeBucket,
    pub relevant_items: usize,
    pub items_total: usize,
}

impl OpportunityDigest {
    fn new(opportunity: &Opportunity, relevant_items: usize, items_total: usize) -> Self {
        Self {
            control_number: opportunity.control_number.clone(),
            title: opportunity.title.clone(),
            organization: opportunity.organization.name.clone(),
            state_code: opportunity.organization.state_code.clone(),
            status: opportunity.status.as_str().to_string(),
            value: opportunity.reference_value(),
            size_bucket: opportunity.size_bucket(),
            relevant_items,
            items_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vocabulary_version: String,
    pub policy: String,
    pub discovery_only: bool,
    pub listing_queries: usize,
    pub fetched: usize,
    pub malformed: usize,
    pub filtered: usize,
    pub candidates: usize,
    pub skipped_dedup: usize,
    pub classified: usize,
    pub relevant: usize,
    pub persisted: usize,
    pub items_persisted: usize,
    pub skipped_error: usize,
    pub listing_errors: usize,
    pub export_failures: usize,
    pub cancelled: bool,
    /// Persisted relevant opportunities, or every candidate in discovery-only runs.
    pub opportunities: Vec<OpportunityDigest>,
}

impl RunSummary {
    fn start(vocabulary_version: &str, policy: String, discovery_only: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            vocabulary_version: vocabulary_version.to_string(),
            policy,
            discovery_only,
            listing_queries: 0,
            fetched: 0,
            malformed: 0,
            filtered: 0,
            candidates: 0,
            skipped_dedup: 0,
            classified: 0,
            relevant: 0,
            persisted: 0,
            items_persisted: 0,
            skipped_error: 0,
            listing_errors: 0,
            export_failures: 0,
            cancelled: false,
            opportunities: Vec::new(),
        }
    }
}

/// Skips opportunities whose processing record is completed, unless forced.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn OpportunityStore>,
    force: bool,
}

impl DedupGate {
    pub fn new(store: Arc<dyn OpportunityStore>, force: bool) -> Self {
        Self { store, force }
    }

    pub async fn already_processed(&self, control_number: &str) -> Result<bool, StoreError> {
        if self.force {
            return Ok(false);
        }
        Ok(self
            .store
            .processing_record(control_number)
            .await?
            .map(|record| record.is_completed())
            .unwrap_or(false))
    }

    pub async fn mark_processed(
        &self,
        control_number: &str,
        outcome: &ProcessingOutcome,
    ) -> Result<(), StoreError> {
        self.store.mark_processed(control_number, outcome).await
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub max_listing_pages: u32,
    pub listing_page_size: u32,
    pub award_scope: AwardScope,
    pub min_value: f64,
    pub max_value: Option<f64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_listing_pages: 100,
            listing_page_size: 50,
            award_scope: AwardScope::RelevantItems,
            min_value: 0.0,
            max_value: None,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_listing_pages: config.max_listing_pages,
            listing_page_size: config.listing_page_size,
            award_scope: config.award_scope,
            min_value: config.min_value,
            max_value: config.max_value,
        }
    }

    fn within_value_range(&self, opportunity: &Opportunity) -> bool {
        let value = opportunity.reference_value();
        value >= self.min_value && self.max_value.map(|max| value <= max).unwrap_or(true)
    }
}

enum WorkerOutcome {
    NotRelevant,
    Persisted {
        digest: OpportunityDigest,
        items: usize,
        export_failed: bool,
    },
}

enum WorkerFailure {
    Source(SourceError),
    Store(StoreError),
}

impl From<SourceError> for WorkerFailure {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<StoreError> for WorkerFailure {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

pub struct DiscoveryPipeline {
    api: Arc<dyn ProcurementApi>,
    details: DetailFetcher,
    matcher: Arc<KeywordMatcher>,
    classifier: Arc<dyn ItemClassifier>,
    store: Arc<dyn OpportunityStore>,
    dashboard: Option<Arc<dyn DashboardSink>>,
    vocabulary_version: String,
    options: PipelineOptions,
}

impl DiscoveryPipeline {
    pub fn new(
        api: Arc<dyn ProcurementApi>,
        details: DetailFetcher,
        vocabulary: &Vocabulary,
        store: Arc<dyn OpportunityStore>,
        options: PipelineOptions,
    ) -> Self {
        let matcher = Arc::new(KeywordMatcher::new(vocabulary));
        let classifier = classifier_for(vocabulary.policy, Arc::clone(&matcher));
        Self {
            api,
            details,
            matcher,
            classifier,
            store,
            dashboard: None,
            vocabulary_version: vocabulary.version.clone(),
            options,
        }
    }

    pub fn with_dashboard(mut self, sink: Arc<dyn DashboardSink>) -> Self {
        self.dashboard = Some(sink);
        self
    }

    /// Build the live pipeline from configuration: shared rate limiter, endpoints, vocabulary.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn OpportunityStore>) -> Result<Self> {
        let vocabulary = Vocabulary::load(&config.vocabulary_path)
            .with_context(|| format!("loading {}", config.vocabulary_path.display()))?;
        let limiter = Arc::new(RateLimiter::new(config.max_requests_per_minute));
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            bearer_token: config.api_token.clone(),
            global_concurrency: config.batch_size.max(1) * 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        })?
        .with_rate_limiter(limiter);
        let client = PncpClient::new(Arc::new(http), config.endpoints.clone())
            .context("validating upstream endpoints")?;
        let api: Arc<dyn ProcurementApi> = Arc::new(client);
        let details = DetailFetcher::new(Arc::clone(&api), config.max_item_pages);

        let mut pipeline = Self::new(
            api,
            details,
            &vocabulary,
            store,
            PipelineOptions::from_config(config),
        );
        if let Some(dashboard) = &config.dashboard {
            let sink = HttpDashboardSink::new(dashboard, &config.user_agent)
                .context("building dashboard sink")?;
            pipeline = pipeline.with_dashboard(Arc::new(sink));
        }
        Ok(pipeline)
    }

    pub async fn run(&self, plan: &RunPlan, cancel: watch::Receiver<bool>) -> Result<RunSummary> {
        if plan.date_from > plan.date_to {
            bail!("start date {} is after end date {}", plan.date_from, plan.date_to);
        }
        let summary = RunSummary::start(
            &self.vocabulary_version,
            self.classifier.policy().label(),
            plan.discovery_only,
        );
        let span = info_span!("run", run_id = %summary.run_id);
        self.execute(plan, cancel, summary).instrument(span).await
    }

    async fn execute(
        &self,
        plan: &RunPlan,
        cancel: watch::Receiver<bool>,
        mut summary: RunSummary,
    ) -> Result<RunSummary> {
        let gate = DedupGate::new(Arc::clone(&self.store), plan.force);
        let queries = plan.queries(self.options.listing_page_size);
        summary.listing_queries = queries.len();
        info!(
            run_id = %summary.run_id,
            queries = queries.len(),
            policy = %summary.policy,
            vocabulary = %self.vocabulary_version,
            "discovery run started"
        );

        let mut seen = HashSet::new();
        let mut pending: Vec<Opportunity> = Vec::with_capacity(self.options.batch_size);

        'queries: for query in &queries {
            if *cancel.borrow() {
                summary.cancelled = true;
                break;
            }
            let mut records = fetch_all(self.api.as_ref(), query, self.options.max_listing_pages);
            while let Some(next) = records.next().await {
                if *cancel.borrow() {
                    summary.cancelled = true;
                    break 'queries;
                }
                let record = match next {
                    Ok(record) => record,
                    Err(err) if err.is_fatal() => {
                        return Err(err).context("listing walk aborted");
                    }
                    Err(err) => {
                        summary.listing_errors += 1;
                        warn!(
                            modality = query.modality,
                            state = query.state_code.as_deref().unwrap_or("*"),
                            from = %query.date_from,
                            to = %query.date_to,
                            error = %err,
                            "listing walk stopped early; keeping records gathered so far"
                        );
                        continue;
                    }
                };
                summary.fetched += 1;

                let opportunity = match parse_opportunity(&record) {
                    Ok(opportunity) => opportunity,
                    Err(err) => {
                        summary.malformed += 1;
                        debug!(error = %err, "dropping malformed listing record");
                        continue;
                    }
                };
                if !seen.insert(opportunity.control_number.clone()) {
                    summary.skipped_dedup += 1;
                    continue;
                }
                if !self.options.within_value_range(&opportunity)
                    || !self
                        .matcher
                        .is_candidate(&opportunity.title, &opportunity.description)
                {
                    summary.filtered += 1;
                    continue;
                }
                summary.candidates += 1;

                if gate
                    .already_processed(&opportunity.control_number)
                    .await
                    .context("checking processing record")?
                {
                    summary.skipped_dedup += 1;
                    continue;
                }

                if plan.discovery_only {
                    summary
                        .opportunities
                        .push(OpportunityDigest::new(&opportunity, 0, 0));
                    continue;
                }

                pending.push(opportunity);
                if pending.len() >= self.options.batch_size {
                    let batch = std::mem::take(&mut pending);
                    self.process_batch(batch, &gate, &mut summary).await?;
                }
            }
        }

        if !pending.is_empty() {
            if *cancel.borrow() {
                summary.cancelled = true;
                info!(dropped = pending.len(), "run cancelled; queued opportunities left for next run");
            } else {
                self.process_batch(pending, &gate, &mut summary).await?;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            fetched = summary.fetched,
            filtered = summary.filtered,
            candidates = summary.candidates,
            skipped_dedup = summary.skipped_dedup,
            relevant = summary.relevant,
            persisted = summary.persisted,
            skipped_error = summary.skipped_error,
            cancelled = summary.cancelled,
            "discovery run finished"
        );
        Ok(summary)
    }

    /// Run one batch to completion; fatal errors surface only after every worker finished.
    async fn process_batch(
        &self,
        batch: Vec<Opportunity>,
        gate: &DedupGate,
        summary: &mut RunSummary,
    ) -> Result<()> {
        debug!(size = batch.len(), "processing batch");
        let results = join_all(batch.iter().map(|opportunity| {
            let span = info_span!("opportunity", control_number = %opportunity.control_number);
            self.process_one(opportunity, gate).instrument(span)
        }))
        .await;

        let mut fatal = None;
        for (opportunity, result) in batch.iter().zip(results) {
            match result {
                Ok(WorkerOutcome::NotRelevant) => summary.classified += 1,
                Ok(WorkerOutcome::Persisted {
                    digest,
                    items,
                    export_failed,
                }) => {
                    summary.classified += 1;
                    summary.relevant += 1;
                    summary.persisted += 1;
                    summary.items_persisted += items;
                    if export_failed {
                        summary.export_failures += 1;
                    }
                    summary.opportunities.push(digest);
                }
                Err(WorkerFailure::Source(err)) if !err.is_fatal() => {
                    summary.skipped_error += 1;
                    warn!(
                        control_number = %opportunity.control_number,
                        error = %err,
                        "skipping opportunity after fetch error"
                    );
                }
                Err(WorkerFailure::Source(err)) => {
                    error!(control_number = %opportunity.control_number, error = %err, "fatal upstream error");
                    fatal.get_or_insert_with(|| anyhow::Error::new(err));
                }
                Err(WorkerFailure::Store(err)) if !err.is_fatal() => {
                    summary.skipped_error += 1;
                    warn!(
                        control_number = %opportunity.control_number,
                        error = %err,
                        "skipping opportunity after store rejected its data"
                    );
                }
                Err(WorkerFailure::Store(err)) => {
                    error!(control_number = %opportunity.control_number, error = %err, "store failure");
                    fatal.get_or_insert_with(|| anyhow::Error::new(err).context("persisting opportunity"));
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn process_one(
        &self,
        opportunity: &Opportunity,
        gate: &DedupGate,
    ) -> Result<WorkerOutcome, WorkerFailure> {
        let classification = self
            .classifier
            .classify(&self.details, &opportunity.reference)
            .await?;

        if !classification.has_relevant_item() {
            gate.mark_processed(
                &opportunity.control_number,
                &self.outcome(&classification),
            )
            .await?;
            debug!(items = classification.items.len(), "no relevant item");
            return Ok(WorkerOutcome::NotRelevant);
        }

        let items = self.attach_awards(opportunity, classification.items.clone()).await?;

        self.store.upsert_organization(&opportunity.organization).await?;
        self.store.upsert_opportunity(opportunity).await?;
        let written = self
            .store
            .upsert_items(&opportunity.control_number, &items, &self.vocabulary_version)
            .await?;
        gate.mark_processed(&opportunity.control_number, &self.outcome(&classification))
            .await?;
        info!(items = written, relevant = classification.relevant, "opportunity persisted");

        let mut export_failed = false;
        if let Some(sink) = &self.dashboard {
            let relevant = items.iter().filter(|i| i.is_relevant).cloned().collect::<Vec<_>>();
            if let Err(err) = sink.push(opportunity, &relevant).await {
                export_failed = true;
                warn!(error = %err, "dashboard export failed; persistence kept");
            }
        }

        Ok(WorkerOutcome::Persisted {
            digest: OpportunityDigest::new(opportunity, classification.relevant, items.len()),
            items: written,
            export_failed,
        })
    }

    async fn attach_awards(
        &self,
        opportunity: &Opportunity,
        mut items: Vec<Item>,
    ) -> Result<Vec<Item>, SourceError> {
        for item in &mut items {
            let wanted = item.has_result
                && match self.options.award_scope {
                    AwardScope::RelevantItems => item.is_relevant,
                    AwardScope::AllFlaggedItems => true,
                    AwardScope::Disabled => false,
                };
            if wanted {
                item.award = self
                    .details
                    .get_item_result(&opportunity.reference, item.sequence)
                    .await?;
            }
        }
        Ok(items)
    }

    fn outcome(&self, classification: &Classification) -> ProcessingOutcome {
        ProcessingOutcome {
            stage: ProcessingStage::Completed,
            has_relevant_item: classification.has_relevant_item(),
            items_total: u32::try_from(classification.items.len()).unwrap_or(u32::MAX),
            items_relevant: u32::try_from(classification.relevant).unwrap_or(u32::MAX),
            vocabulary_version: self.vocabulary_version.clone(),
        }
    }
}

/// Postgres store for real runs, in-memory store for dry runs.
pub async fn open_store(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn OpportunityStore>> {
    if dry_run {
        info!("dry run: using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set (use --dry-run to run without a database)");
    };
    let store = PgStore::connect(url, (config.batch_size as u32).saturating_mul(2))
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ppof_adapters::Page;
    use ppof_core::{OpportunityRef, Organization, ProcessingRecord};
    use ppof_http::FetchError;
    use serde_json::{json, Value as JsonValue};

    use crate::export::ExportError;

    const VOCAB: &str = r#"
version: "seals-v1"
policy: { mode: exhaustive }
core_terms: [lacre]
contextual_phrases: ["security seal"]
exclude_terms: ["caixa d'água"]
"#;

    /// Scripted upstream: one listing, per-opportunity items, per-item results.
    #[derive(Default)]
    struct ScriptedApi {
        listing: Vec<JsonValue>,
        items: BTreeMap<String, Vec<JsonValue>>,
        results: BTreeMap<(String, i64), Vec<JsonValue>>,
        failing_items: HashSet<String>,
        listing_calls: AtomicUsize,
        item_calls: AtomicUsize,
        result_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn detail_calls(&self) -> usize {
            self.item_calls.load(Ordering::SeqCst) + self.result_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcurementApi for ScriptedApi {
        async fn listing_page(&self, _query: &ListingQuery, page: u32) -> Result<Page, SourceError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if page == 1 {
                Ok(Page {
                    records: self.listing.clone(),
                    remaining: Some(0),
                })
            } else {
                Ok(Page::default())
            }
        }

        async fn items_page(
            &self,
            opportunity: &OpportunityRef,
            page: u32,
            _page_size: u32,
        ) -> Result<Page, SourceError> {
            self.item_calls.fetch_add(1, Ordering::SeqCst);
            let key = opportunity.to_string();
            if self.failing_items.contains(&key) {
                return Err(SourceError::Fetch(FetchError::HttpStatus {
                    status: 503,
                    url: key,
                }));
            }
            if page > 1 {
                return Ok(Page::default());
            }
            Ok(Page {
                records: self.items.get(&key).cloned().unwrap_or_default(),
                remaining: None,
            })
        }

        async fn item_results(
            &self,
            opportunity: &OpportunityRef,
            item_number: i64,
        ) -> Result<Option<Page>, SourceError> {
            self.result_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .results
                .get(&(opportunity.to_string(), item_number))
                .map(|records| Page {
                    records: records.clone(),
                    remaining: None,
                }))
        }
    }

    fn listing_record(seq: i64, title: &str, value: f64) -> JsonValue {
        json!({
            "numeroControlePNCP": format!("11222333000144-1-{seq:06}/2025"),
            "orgaoEntidade": { "cnpj": "11222333000144", "razaoSocial": "PREFEITURA MUNICIPAL DE TESTE" },
            "unidadeOrgao": { "ufSigla": "SP" },
            "anoCompra": 2025,
            "sequencialCompra": seq,
            "objetoCompra": title,
            "situacaoCompraNome": "Divulgada no PNCP",
            "valorTotalEstimado": value,
        })
    }

    fn item_record(n: i64, description: &str, has_result: bool) -> JsonValue {
        json!({ "numeroItem": n, "descricao": description, "temResultado": has_result })
    }

    fn key(seq: i64) -> String {
        OpportunityRef::new("11222333000144", 2025, seq).to_string()
    }

    fn scripted() -> ScriptedApi {
        let mut api = ScriptedApi {
            listing: vec![
                listing_record(1, "Aquisição de lacres de segurança", 10_000.0),
                listing_record(2, "Material de limpeza", 5_000.0),
                listing_record(3, "Material diverso com security seal", 90_000.0),
                listing_record(4, "Lacres para hidrômetros", 7_000.0),
                json!({ "objetoCompra": "lacre sem identificador" }),
            ],
            ..ScriptedApi::default()
        };
        api.items.insert(
            key(1),
            vec![
                item_record(1, "Lacre plástico numerado", true),
                item_record(2, "Papel A4", true),
                item_record(3, "Lacre metálico", false),
            ],
        );
        api.items.insert(
            key(3),
            vec![item_record(1, "Cadeado", false), item_record(2, "Fita crepe", false)],
        );
        api.items.insert(key(4), vec![item_record(1, "Lacre para hidrômetro", true)]);
        api.results.insert(
            (key(1), 1),
            vec![json!({ "niFornecedor": "99", "nomeRazaoSocialFornecedor": "ACME", "valorUnitarioHomologado": 0.5 })],
        );
        api
    }

    fn plan() -> RunPlan {
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        RunPlan {
            states: vec!["SP".into()],
            modalities: vec![6],
            ..RunPlan::new(day, day)
        }
    }

    fn pipeline(api: Arc<ScriptedApi>, store: Arc<MemoryStore>, options: PipelineOptions) -> DiscoveryPipeline {
        let vocabulary = Vocabulary::from_yaml_str(VOCAB).unwrap();
        let details = DetailFetcher::new(api.clone(), 20);
        DiscoveryPipeline::new(api, details, &vocabulary, store, options)
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn plan_chunks_dates_and_fans_out_queries() {
        let plan = RunPlan {
            states: vec!["SP".into(), "RJ".into()],
            modalities: vec![6, 8],
            chunk_days: 7,
            ..RunPlan::new(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            )
        };
        let chunks = plan.date_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap());
        assert_eq!(chunks[2], (
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        ));
        assert_eq!(plan.queries(50).len(), 3 * 2 * 2);

        let lookback = RunPlan::lookback(NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(), 1);
        assert_eq!(lookback.date_from, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(lookback.states.len(), 27);
        assert_eq!(lookback.modalities, vec![1, 4, 6, 8, 12]);
    }

    #[tokio::test]
    async fn run_classifies_persists_and_counts() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let summary = pipeline(api.clone(), store.clone(), PipelineOptions::default())
            .run(&plan(), not_cancelled())
            .await
            .unwrap();

        assert_eq!(summary.fetched, 5);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.classified, 3);
        assert_eq!(summary.relevant, 2);
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.skipped_error, 0);

        // opportunity 3 passed the pre-filter but had no relevant item
        assert!(store.opportunity(&format!("11222333000144-1-{:06}/2025", 3)).await.is_none());
        let record = store
            .processing_record(&format!("11222333000144-1-{:06}/2025", 3))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.outcome.has_relevant_item);

        let items = store.items(&format!("11222333000144-1-{:06}/2025", 1)).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items.iter().filter(|i| i.is_relevant).count(), 2);
        assert_eq!(items[0].award.as_ref().and_then(|a| a.winner_name.as_deref()), Some("ACME"));
        // item 2 has a result flag but is not relevant: no lookup under the default scope
        assert!(items[1].award.is_none());
        // item 3 has no result flag
        assert!(items[2].award.is_none());
        // lookups: opp 1 item 1, opp 4 item 1
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_run_never_reaches_the_detail_fetcher() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(api.clone(), store.clone(), PipelineOptions::default());

        pipeline.run(&plan(), not_cancelled()).await.unwrap();
        let detail_calls = api.detail_calls();
        assert!(detail_calls > 0);

        let second = pipeline.run(&plan(), not_cancelled()).await.unwrap();
        assert_eq!(api.detail_calls(), detail_calls);
        assert_eq!(second.skipped_dedup, 3);
        assert_eq!(second.classified, 0);
    }

    #[tokio::test]
    async fn repeated_runs_converge_on_the_same_item_set() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(api.clone(), store.clone(), PipelineOptions::default());

        let mut forced = plan();
        forced.force = true;
        pipeline.run(&forced, not_cancelled()).await.unwrap();
        let first = store.all_items().await;
        let first_opps = store.opportunities().await;
        pipeline.run(&forced, not_cancelled()).await.unwrap();

        assert_eq!(store.all_items().await, first);
        assert_eq!(store.opportunities().await.len(), first_opps.len());
        assert_eq!(store.item_writes().await, 4);
    }

    #[tokio::test]
    async fn transient_failure_skips_only_that_opportunity() {
        let mut api = scripted();
        api.failing_items.insert(key(1));
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let summary = pipeline(api, store.clone(), PipelineOptions::default())
            .run(&plan(), not_cancelled())
            .await
            .unwrap();

        assert_eq!(summary.skipped_error, 1);
        assert_eq!(summary.persisted, 1);
        // not marked, so the next run retries it
        assert!(store
            .processing_record(&format!("11222333000144-1-{:06}/2025", 1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn repeated_item_numbers_skip_only_that_opportunity() {
        let mut api = scripted();
        api.items.insert(
            key(1),
            vec![
                item_record(1, "Lacre plástico", false),
                item_record(1, "Lacre plástico", false),
            ],
        );
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let summary = pipeline(api, store.clone(), PipelineOptions::default())
            .run(&plan(), not_cancelled())
            .await
            .unwrap();

        assert_eq!(summary.skipped_error, 1);
        assert_eq!(summary.persisted, 1);
        let control = format!("11222333000144-1-{:06}/2025", 1);
        assert!(store.opportunity(&control).await.is_none());
        assert!(store.items(&control).await.is_empty());
        assert!(store.processing_record(&control).await.unwrap().is_none());
        assert!(store
            .opportunity(&format!("11222333000144-1-{:06}/2025", 4))
            .await
            .is_some());
    }

    /// Memory store whose item writes fail for one opportunity.
    struct RejectingItemStore {
        inner: MemoryStore,
        rejected: String,
    }

    #[async_trait]
    impl OpportunityStore for RejectingItemStore {
        async fn upsert_organization(&self, organization: &Organization) -> Result<(), StoreError> {
            self.inner.upsert_organization(organization).await
        }

        async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
            self.inner.upsert_opportunity(opportunity).await
        }

        async fn upsert_items(
            &self,
            control_number: &str,
            items: &[Item],
            vocabulary_version: &str,
        ) -> Result<usize, StoreError> {
            if control_number == self.rejected {
                return Err(StoreError::DuplicateItem {
                    control_number: control_number.to_string(),
                    sequence: 1,
                });
            }
            self.inner.upsert_items(control_number, items, vocabulary_version).await
        }

        async fn processing_record(
            &self,
            control_number: &str,
        ) -> Result<Option<ProcessingRecord>, StoreError> {
            self.inner.processing_record(control_number).await
        }

        async fn mark_processed(
            &self,
            control_number: &str,
            outcome: &ProcessingOutcome,
        ) -> Result<(), StoreError> {
            self.inner.mark_processed(control_number, outcome).await
        }
    }

    #[tokio::test]
    async fn rejected_item_write_is_counted_not_fatal() {
        let api = Arc::new(scripted());
        let rejected = format!("11222333000144-1-{:06}/2025", 1);
        let store = Arc::new(RejectingItemStore {
            inner: MemoryStore::new(),
            rejected: rejected.clone(),
        });
        let vocabulary = Vocabulary::from_yaml_str(VOCAB).unwrap();
        let details = DetailFetcher::new(api.clone(), 20);
        let summary = DiscoveryPipeline::new(
            api,
            details,
            &vocabulary,
            store.clone(),
            PipelineOptions::default(),
        )
        .run(&plan(), not_cancelled())
        .await
        .unwrap();

        assert_eq!(summary.skipped_error, 1);
        assert_eq!(summary.persisted, 1);
        // unmarked, so the next run retries it
        assert!(store.processing_record(&rejected).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn value_filter_and_discovery_only_skip_detail_work() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let options = PipelineOptions {
            max_value: Some(50_000.0),
            ..PipelineOptions::default()
        };
        let mut discovery = plan();
        discovery.discovery_only = true;
        let summary = pipeline(api.clone(), store.clone(), options)
            .run(&discovery, not_cancelled())
            .await
            .unwrap();

        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.opportunities.len(), 2);
        assert_eq!(api.detail_calls(), 0);
        assert!(store.processing_records().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_new_fetches() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let summary = pipeline(api.clone(), store, PipelineOptions::default())
            .run(&plan(), rx)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(api.listing_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.detail_calls(), 0);
    }

    struct FailingSink {
        called: AtomicBool,
    }

    #[async_trait]
    impl DashboardSink for FailingSink {
        async fn push(&self, _opportunity: &Opportunity, _items: &[Item]) -> Result<(), ExportError> {
            self.called.store(true, Ordering::SeqCst);
            Err(ExportError::Setup("dashboard offline".into()))
        }
    }

    #[tokio::test]
    async fn export_failures_do_not_roll_back_persistence() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FailingSink {
            called: AtomicBool::new(false),
        });
        let summary = pipeline(api, store.clone(), PipelineOptions::default())
            .with_dashboard(sink.clone())
            .run(&plan(), not_cancelled())
            .await
            .unwrap();

        assert!(sink.called.load(Ordering::SeqCst));
        assert_eq!(summary.export_failures, 2);
        assert_eq!(summary.persisted, 2);
        assert_eq!(store.opportunities().await.len(), 2);
    }

    #[tokio::test]
    async fn award_scope_controls_lookups() {
        let api = Arc::new(scripted());
        let store = Arc::new(MemoryStore::new());
        let options = PipelineOptions {
            award_scope: AwardScope::AllFlaggedItems,
            ..PipelineOptions::default()
        };
        pipeline(api.clone(), store, options)
            .run(&plan(), not_cancelled())
            .await
            .unwrap();
        // opp 1 items 1 and 2, opp 4 item 1
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 3);

        let api = Arc::new(scripted());
        let options = PipelineOptions {
            award_scope: AwardScope::Disabled,
            ..PipelineOptions::default()
        };
        pipeline(api.clone(), Arc::new(MemoryStore::new()), options)
            .run(&plan(), not_cancelled())
            .await
            .unwrap();
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inverted_date_range_is_rejected() {
        let api = Arc::new(scripted());
        let mut bad = plan();
        bad.date_from = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
        let err = pipeline(api, Arc::new(MemoryStore::new()), PipelineOptions::default())
            .run(&bad, not_cancelled())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after end date"));
    }

    #[tokio::test]
    async fn dry_run_store_needs_no_database() {
        let config = SyncConfig::default();
        assert!(open_store(&config, true).await.is_ok());
        assert!(open_store(&config, false).await.is_err());
    }
}
