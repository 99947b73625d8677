//! Upstream procurement API contract, response normalization, pagination, detail/award fetch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use ppof_core::{
    normalize_registration_id, Item, ItemAward, JurisdictionLevel, Opportunity, OpportunityRef,
    OpportunityStatus, Organization,
};
use ppof_http::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ppof-adapters";

pub const DEFAULT_LISTING_BASE_URL: &str = "https://pncp.gov.br/api/consulta";
pub const DEFAULT_ITEMS_BASE_URL: &str = "https://pncp.gov.br/api/pncp";
pub const DEFAULT_RESULTS_BASE_URL: &str = "https://pncp.gov.br/api";

pub const MIN_LISTING_PAGE_SIZE: u32 = 10;
pub const MAX_LISTING_PAGE_SIZE: u32 = 50;
pub const DEFAULT_ITEM_PAGE_SIZE: u32 = 100;

/// Contracting modality codes walked when none are configured.
pub const DEFAULT_MODALITIES: &[i32] = &[1, 4, 6, 8, 12];

pub const ALL_STATE_CODES: &[&str] = &[
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {context}: {message}")]
    Malformed { context: String, message: String },
    #[error("upstream rejected credentials (status {status})")]
    Unauthorized { status: u16 },
    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}

impl SourceError {
    pub fn malformed(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Malformed {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Auth and configuration failures abort the run; everything else is scoped to one call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config(_))
    }
}

fn classify_fetch_error(err: FetchError) -> SourceError {
    if err.is_auth() {
        SourceError::Unauthorized {
            status: err.status().unwrap_or_default(),
        }
    } else {
        SourceError::Fetch(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub modality: i32,
    pub state_code: Option<String>,
    pub municipality_code: Option<String>,
    pub organization_id: Option<String>,
    pub page_size: u32,
}

impl ListingQuery {
    pub fn new(date_from: NaiveDate, date_to: NaiveDate, modality: i32) -> Self {
        Self {
            date_from,
            date_to,
            modality,
            state_code: None,
            municipality_code: None,
            organization_id: None,
            page_size: MAX_LISTING_PAGE_SIZE,
        }
    }

    pub fn with_state(mut self, state_code: impl Into<String>) -> Self {
        self.state_code = Some(state_code.into());
        self
    }

    pub fn to_params(&self, page: u32) -> Vec<(&'static str, String)> {
        let page_size = self
            .page_size
            .clamp(MIN_LISTING_PAGE_SIZE, MAX_LISTING_PAGE_SIZE);
        let mut params = vec![
            ("dataInicial", self.date_from.format("%Y%m%d").to_string()),
            ("dataFinal", self.date_to.format("%Y%m%d").to_string()),
            ("codigoModalidadeContratacao", self.modality.to_string()),
            ("pagina", page.to_string()),
            ("tamanhoPagina", page_size.to_string()),
        ];
        if let Some(uf) = &self.state_code {
            params.push(("uf", uf.clone()));
        }
        if let Some(code) = &self.municipality_code {
            params.push(("codigoMunicipioIbge", code.clone()));
        }
        if let Some(id) = &self.organization_id {
            params.push(("cnpj", normalize_registration_id(id)));
        }
        params
    }
}

/// Raw page body: the upstream answers either with a bare array or with an envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PageResponse {
    Records(Vec<JsonValue>),
    Envelope {
        data: Vec<JsonValue>,
        #[serde(default, rename = "paginasRestantes", alias = "remaining")]
        remaining: Option<i64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<JsonValue>,
    /// Remaining pages after this one, when the envelope says so.
    pub remaining: Option<u64>,
}

impl From<PageResponse> for Page {
    fn from(value: PageResponse) -> Self {
        match value {
            PageResponse::Records(records) => Page {
                records,
                remaining: None,
            },
            PageResponse::Envelope { data, remaining } => Page {
                records: data,
                remaining: remaining.map(|r| r.max(0) as u64),
            },
        }
    }
}

impl Page {
    pub fn parse(body: &[u8], context: &str) -> Result<Self, SourceError> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Page::default());
        }
        let response: PageResponse =
            serde_json::from_slice(body).map_err(|e| SourceError::malformed(context, e))?;
        Ok(response.into())
    }
}

#[async_trait]
pub trait ProcurementApi: Send + Sync {
    async fn listing_page(&self, query: &ListingQuery, page: u32) -> Result<Page, SourceError>;

    async fn items_page(
        &self,
        opportunity: &OpportunityRef,
        page: u32,
        page_size: u32,
    ) -> Result<Page, SourceError>;

    /// `Ok(None)` when the result endpoint has nothing for this item.
    async fn item_results(
        &self,
        opportunity: &OpportunityRef,
        item_number: i64,
    ) -> Result<Option<Page>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub listing_base: String,
    pub items_base: String,
    pub results_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            listing_base: DEFAULT_LISTING_BASE_URL.to_string(),
            items_base: DEFAULT_ITEMS_BASE_URL.to_string(),
            results_base: DEFAULT_RESULTS_BASE_URL.to_string(),
        }
    }
}

impl Endpoints {
    pub fn validate(&self) -> Result<(), SourceError> {
        for (name, url) in [
            ("listing", &self.listing_base),
            ("items", &self.items_base),
            ("results", &self.results_base),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SourceError::Config(format!(
                    "{name} base url must be http(s): {url:?}"
                )));
            }
        }
        if trim_base(&self.results_base) == trim_base(&self.listing_base) {
            return Err(SourceError::Config(format!(
                "results base url must not be the listing base url ({})",
                self.listing_base
            )));
        }
        Ok(())
    }

    pub fn listing_url(&self) -> String {
        format!("{}/v1/contratacoes/publicacao", trim_base(&self.listing_base))
    }

    pub fn items_url(&self, opportunity: &OpportunityRef) -> String {
        format!(
            "{}/v1/orgaos/{}/compras/{}/{}/itens",
            trim_base(&self.items_base),
            opportunity.organization_id,
            opportunity.year,
            opportunity.sequence
        )
    }

    pub fn results_url(&self, opportunity: &OpportunityRef, item_number: i64) -> String {
        format!(
            "{}/v1/orgaos/{}/compras/{}/{}/itens/{}/resultados",
            trim_base(&self.results_base),
            opportunity.organization_id,
            opportunity.year,
            opportunity.sequence,
            item_number
        )
    }
}

fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// `ProcurementApi` over the public HTTP endpoints.
#[derive(Debug, Clone)]
pub struct PncpClient {
    http: Arc<HttpFetcher>,
    endpoints: Endpoints,
}

impl PncpClient {
    pub fn new(http: Arc<HttpFetcher>, endpoints: Endpoints) -> Result<Self, SourceError> {
        endpoints.validate()?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn get_page(
        &self,
        url: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<Option<Page>, SourceError> {
        match self.http.get_json(url, query).await {
            Ok(resp) => Page::parse(&resp.body, context).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(classify_fetch_error(err)),
        }
    }
}

#[async_trait]
impl ProcurementApi for PncpClient {
    async fn listing_page(&self, query: &ListingQuery, page: u32) -> Result<Page, SourceError> {
        let url = self.endpoints.listing_url();
        let params = query.to_params(page);
        Ok(self
            .get_page(&url, &params, "listing page")
            .await?
            .unwrap_or_default())
    }

    async fn items_page(
        &self,
        opportunity: &OpportunityRef,
        page: u32,
        page_size: u32,
    ) -> Result<Page, SourceError> {
        let url = self.endpoints.items_url(opportunity);
        let params = [
            ("pagina", page.to_string()),
            ("tamanhoPagina", page_size.to_string()),
        ];
        Ok(self
            .get_page(&url, &params, "item page")
            .await?
            .unwrap_or_default())
    }

    async fn item_results(
        &self,
        opportunity: &OpportunityRef,
        item_number: i64,
    ) -> Result<Option<Page>, SourceError> {
        let url = self.endpoints.results_url(opportunity, item_number);
        self.get_page(&url, &[], "item results").await
    }
}

struct WalkState<F> {
    next_page: u32,
    fetch_page: F,
    done: bool,
}

/// Lazily walk numbered pages starting at 1.
///
/// Stops on an empty page, then on an envelope reporting zero remaining pages, then at
/// `max_pages` (logged: the result set may be incomplete). An error is yielded once and
/// ends the walk; records already yielded stay with the caller.
pub fn paginate<'a, F, Fut>(
    label: &'a str,
    max_pages: u32,
    fetch_page: F,
) -> BoxStream<'a, Result<JsonValue, SourceError>>
where
    F: FnMut(u32) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page, SourceError>> + Send + 'a,
{
    let state = WalkState {
        next_page: 1,
        fetch_page,
        done: false,
    };
    stream::unfold(state, move |mut state| async move {
        if state.done {
            return None;
        }
        if state.next_page > max_pages {
            warn!(label, max_pages, "pagination safety ceiling reached; result set may be incomplete");
            return None;
        }
        let page_no = state.next_page;
        match (state.fetch_page)(page_no).await {
            Err(err) => {
                warn!(label, page = page_no, error = %err, "pagination stopped on error");
                state.done = true;
                Some((vec![Err(err)], state))
            }
            Ok(page) => {
                if page.records.is_empty() {
                    return None;
                }
                if page.remaining == Some(0) {
                    state.done = true;
                }
                debug!(label, page = page_no, records = page.records.len(), "page fetched");
                state.next_page += 1;
                Some((page.records.into_iter().map(Ok).collect::<Vec<_>>(), state))
            }
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

/// Listing walk for one query; every page request goes through the API's rate limiter.
pub fn fetch_all<'a>(
    api: &'a dyn ProcurementApi,
    query: &'a ListingQuery,
    max_pages: u32,
) -> BoxStream<'a, Result<JsonValue, SourceError>> {
    paginate("listing", max_pages, move |page| api.listing_page(query, page))
}

/// Drain a walk into the partial record list plus the error that stopped it, if any.
pub async fn collect_all(
    mut records: BoxStream<'_, Result<JsonValue, SourceError>>,
) -> (Vec<JsonValue>, Option<SourceError>) {
    let mut out = Vec::new();
    while let Some(next) = records.next().await {
        match next {
            Ok(record) => out.push(record),
            Err(err) => return (out, Some(err)),
        }
    }
    (out, None)
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let cur = json_at(value, path)?;
    cur.as_f64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let cur = json_at(value, path)?;
    cur.as_i64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path)?.as_bool()
}

/// Numeric or string code rendered as text.
fn json_code(value: &JsonValue, path: &[&str]) -> Option<String> {
    let cur = json_at(value, path)?;
    match cur {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn jurisdiction_of(record: &JsonValue, organization_name: &str) -> JurisdictionLevel {
    if let Some(level) = json_str(record, &["orgaoEntidade", "esferaId"])
        .and_then(JurisdictionLevel::from_sphere_code)
    {
        return level;
    }
    for (flag, level) in [
        ("esferaFederal", JurisdictionLevel::Federal),
        ("esferaEstadual", JurisdictionLevel::State),
        ("esferaMunicipal", JurisdictionLevel::Municipal),
        ("esferaDistrital", JurisdictionLevel::District),
    ] {
        if json_bool(record, &[flag]) == Some(true) {
            return level;
        }
    }
    JurisdictionLevel::from_organization_name(organization_name)
}

fn sector_of(record: &JsonValue) -> Option<String> {
    let label = match json_str(record, &["orgaoEntidade", "poderId"])? {
        "E" => "executive",
        "L" => "legislative",
        "J" => "judiciary",
        other => return Some(other.to_ascii_lowercase()),
    };
    Some(label.to_string())
}

/// Build an `Opportunity` from one listing record.
pub fn parse_opportunity(record: &JsonValue) -> Result<Opportunity, SourceError> {
    let control_number = json_str(record, &["numeroControlePNCP"])
        .ok_or_else(|| SourceError::malformed("listing record", "missing numeroControlePNCP"))?
        .to_string();
    let organization_id = json_str(record, &["orgaoEntidade", "cnpj"])
        .or_else(|| json_str(record, &["cnpj"]))
        .ok_or_else(|| SourceError::malformed(&control_number, "missing organization id"))?;
    let year = json_i64(record, &["anoCompra"])
        .ok_or_else(|| SourceError::malformed(&control_number, "missing anoCompra"))?;
    let sequence = json_i64(record, &["sequencialCompra"])
        .ok_or_else(|| SourceError::malformed(&control_number, "missing sequencialCompra"))?;
    let year = i32::try_from(year)
        .map_err(|_| SourceError::malformed(&control_number, format!("year out of range: {year}")))?;

    let reference = OpportunityRef::new(organization_id, year, sequence);
    let organization_name = json_str(record, &["orgaoEntidade", "razaoSocial"])
        .or_else(|| json_str(record, &["unidadeOrgao", "nomeUnidade"]))
        .unwrap_or_default()
        .to_string();
    let organization = Organization {
        registration_id: reference.organization_id.clone(),
        jurisdiction: jurisdiction_of(record, &organization_name),
        sector: sector_of(record),
        state_code: json_str(record, &["unidadeOrgao", "ufSigla"]).map(ToString::to_string),
        name: organization_name,
    };

    let awarded_value = json_f64(record, &["valorTotalHomologado"]).filter(|v| *v > 0.0);
    let status = OpportunityStatus::from_source_label(
        json_str(record, &["situacaoCompraNome"]),
        awarded_value.is_some(),
    );

    Ok(Opportunity {
        control_number,
        reference,
        organization,
        title: json_str(record, &["objetoCompra"])
            .unwrap_or_default()
            .to_string(),
        description: json_str(record, &["informacaoComplementar"])
            .unwrap_or_default()
            .to_string(),
        status,
        published_at: json_str(record, &["dataPublicacaoPncp"]).and_then(parse_timestamp),
        estimated_value: json_f64(record, &["valorTotalEstimado"]),
        awarded_value,
        modality: json_i64(record, &["modalidadeId"]).and_then(|m| i32::try_from(m).ok()),
        municipality_code: json_code(record, &["unidadeOrgao", "codigoIbge"]),
    })
}

/// Build an `Item` from one item record. Classification and award fields start empty.
pub fn parse_item(record: &JsonValue) -> Result<Item, SourceError> {
    let sequence = json_i64(record, &["numeroItem"])
        .ok_or_else(|| SourceError::malformed("item record", "missing numeroItem"))?;
    Ok(Item {
        sequence,
        description: json_str(record, &["descricao"])
            .unwrap_or_default()
            .to_string(),
        quantity: json_f64(record, &["quantidade"]),
        unit: json_str(record, &["unidadeMedida"]).map(ToString::to_string),
        estimated_unit_value: json_f64(record, &["valorUnitarioEstimado"]),
        estimated_total_value: json_f64(record, &["valorTotal"]),
        has_result: json_bool(record, &["temResultado"]).unwrap_or(false),
        is_relevant: false,
        award: None,
    })
}

fn result_unit_value(result: &JsonValue) -> Option<f64> {
    json_f64(result, &["valorUnitarioHomologado"]).or_else(|| json_f64(result, &["valorUnitario"]))
}

/// Pick the winning bid: explicit winner marker first, otherwise the lowest unit value.
pub fn select_winner(results: &[JsonValue]) -> Option<&JsonValue> {
    let marked = results.iter().find(|r| {
        json_str(r, &["situacao"])
            .map(|s| s.eq_ignore_ascii_case("vencedor"))
            .unwrap_or(false)
            || json_i64(r, &["classificacao"]) == Some(1)
    });
    if marked.is_some() {
        return marked;
    }
    results
        .iter()
        .filter_map(|r| result_unit_value(r).map(|v| (v, r)))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, r)| r)
}

/// Award fields of one result record; `None` when it carries none of them.
pub fn parse_award(result: &JsonValue) -> Option<ItemAward> {
    let award = ItemAward {
        winner_id: json_str(result, &["niFornecedor"])
            .or_else(|| json_str(result, &["cnpjProponente"]))
            .map(normalize_registration_id),
        winner_name: json_str(result, &["nomeRazaoSocialFornecedor"])
            .or_else(|| json_str(result, &["nomeProponente"]))
            .map(ToString::to_string),
        unit_value: result_unit_value(result),
        total_value: json_f64(result, &["valorTotalHomologado"])
            .or_else(|| json_f64(result, &["valorTotal"])),
    };
    if award == ItemAward::default() {
        None
    } else {
        Some(award)
    }
}

/// Item list and award retrieval for one opportunity at a time.
#[derive(Clone)]
pub struct DetailFetcher {
    api: Arc<dyn ProcurementApi>,
    item_page_size: u32,
    max_item_pages: u32,
}

impl std::fmt::Debug for DetailFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailFetcher")
            .field("item_page_size", &self.item_page_size)
            .field("max_item_pages", &self.max_item_pages)
            .finish()
    }
}

impl DetailFetcher {
    pub fn new(api: Arc<dyn ProcurementApi>, max_item_pages: u32) -> Self {
        Self {
            api,
            item_page_size: DEFAULT_ITEM_PAGE_SIZE,
            max_item_pages: max_item_pages.max(1),
        }
    }

    pub fn with_item_page_size(mut self, page_size: u32) -> Self {
        self.item_page_size = page_size.max(1);
        self
    }

    /// Every item of the opportunity. A failure on any page, or a repeated item sequence,
    /// fails the whole call.
    pub async fn get_items_all(&self, opportunity: &OpportunityRef) -> Result<Vec<Item>, SourceError> {
        let api = Arc::clone(&self.api);
        let page_size = self.item_page_size;
        let label = opportunity.to_string();
        let walk = paginate(&label, self.max_item_pages, move |page| {
            let api = Arc::clone(&api);
            let opportunity = opportunity.clone();
            async move { api.items_page(&opportunity, page, page_size).await }
        });
        let (records, error) = collect_all(walk).await;
        if let Some(err) = error {
            return Err(err);
        }
        let items = records.iter().map(parse_item).collect::<Result<Vec<_>, _>>()?;
        let mut seen = HashSet::with_capacity(items.len());
        if let Some(repeated) = items.iter().find(|item| !seen.insert(item.sequence)) {
            return Err(SourceError::malformed(
                label,
                format!("item sequence {} appears twice", repeated.sequence),
            ));
        }
        Ok(items)
    }

    /// The first `count` items, read from the first page only.
    pub async fn sample_items(
        &self,
        opportunity: &OpportunityRef,
        count: usize,
    ) -> Result<Vec<Item>, SourceError> {
        let page = self
            .api
            .items_page(opportunity, 1, self.item_page_size)
            .await?;
        page.records.iter().take(count).map(parse_item).collect()
    }

    /// Award for one item. Absent, empty or malformed result payloads mean "no award".
    pub async fn get_item_result(
        &self,
        opportunity: &OpportunityRef,
        item_number: i64,
    ) -> Result<Option<ItemAward>, SourceError> {
        let page = match self.api.item_results(opportunity, item_number).await {
            Ok(Some(page)) => page,
            Ok(None) => return Ok(None),
            Err(SourceError::Malformed { context, message }) => {
                debug!(%opportunity, item_number, context = %context, message = %message, "ignoring malformed award payload");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        Ok(select_winner(&page.records).and_then(parse_award))
    }
}
