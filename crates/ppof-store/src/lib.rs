//! Persistence for organizations, opportunities, items and processing records.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ppof_core::{
    Item, ItemAward, JurisdictionLevel, Opportunity, Organization, ProcessingOutcome,
    ProcessingRecord, ProcessingStage,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "ppof-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("opportunity {0} is not persisted")]
    MissingOpportunity(String),
    #[error("organization {0} is not persisted")]
    MissingOrganization(String),
    #[error("item sequence {sequence} appears twice for opportunity {control_number}")]
    DuplicateItem { control_number: String, sequence: i64 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connection, migration and row-decoding failures. The others come from one
    /// opportunity's data and leave the store usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Migrate(_) | Self::Corrupt(_))
    }
}

/// Natural-key persistence used by the pipeline. Every write is an upsert.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn upsert_organization(&self, organization: &Organization) -> Result<(), StoreError>;

    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError>;

    /// Replace the opportunity's item set in one transaction. Award fields missing from the
    /// new set keep their stored values.
    async fn upsert_items(
        &self,
        control_number: &str,
        items: &[Item],
        vocabulary_version: &str,
    ) -> Result<usize, StoreError>;

    async fn processing_record(
        &self,
        control_number: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError>;

    /// Insert or overwrite. Writing the same outcome again changes nothing.
    async fn mark_processed(
        &self,
        control_number: &str,
        outcome: &ProcessingOutcome,
    ) -> Result<(), StoreError>;
}

fn check_unique_sequences(control_number: &str, items: &[Item]) -> Result<(), StoreError> {
    let mut seen = BTreeSet::new();
    for item in items {
        if !seen.insert(item.sequence) {
            return Err(StoreError::DuplicateItem {
                control_number: control_number.to_string(),
                sequence: item.sequence,
            });
        }
    }
    Ok(())
}

fn count_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert_organization(&self, organization: &Organization) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO organizations (registration_id, name, jurisdiction, sector, state_code)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (registration_id) DO UPDATE
               SET name = CASE WHEN EXCLUDED.name = '' THEN organizations.name ELSE EXCLUDED.name END,
                   jurisdiction = CASE WHEN EXCLUDED.jurisdiction = 'unknown'
                                       THEN organizations.jurisdiction
                                       ELSE EXCLUDED.jurisdiction END,
                   sector = COALESCE(EXCLUDED.sector, organizations.sector),
                   state_code = COALESCE(EXCLUDED.state_code, organizations.state_code),
                   updated_at = NOW()
            "#,
        )
        .bind(&organization.registration_id)
        .bind(&organization.name)
        .bind(organization.jurisdiction.as_str())
        .bind(&organization.sector)
        .bind(&organization.state_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO opportunities (
                control_number, organization_id, year, sequence, title, description, status,
                published_at, estimated_value, awarded_value, modality, municipality_code, size_bucket
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (control_number) DO UPDATE
               SET title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   status = EXCLUDED.status,
                   published_at = COALESCE(EXCLUDED.published_at, opportunities.published_at),
                   estimated_value = COALESCE(EXCLUDED.estimated_value, opportunities.estimated_value),
                   awarded_value = COALESCE(EXCLUDED.awarded_value, opportunities.awarded_value),
                   modality = COALESCE(EXCLUDED.modality, opportunities.modality),
                   municipality_code = COALESCE(EXCLUDED.municipality_code, opportunities.municipality_code),
                   size_bucket = EXCLUDED.size_bucket,
                   updated_at = NOW()
            "#,
        )
        .bind(&opportunity.control_number)
        .bind(&opportunity.reference.organization_id)
        .bind(opportunity.reference.year)
        .bind(opportunity.reference.sequence)
        .bind(&opportunity.title)
        .bind(&opportunity.description)
        .bind(opportunity.status.as_str())
        .bind(opportunity.published_at)
        .bind(opportunity.estimated_value)
        .bind(opportunity.awarded_value)
        .bind(opportunity.modality)
        .bind(&opportunity.municipality_code)
        .bind(opportunity.size_bucket().as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => Err(
                StoreError::MissingOrganization(opportunity.reference.organization_id.clone()),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn upsert_items(
        &self,
        control_number: &str,
        items: &[Item],
        vocabulary_version: &str,
    ) -> Result<usize, StoreError> {
        check_unique_sequences(control_number, items)?;

        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM opportunities WHERE control_number = $1 FOR UPDATE")
            .bind(control_number)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::MissingOpportunity(control_number.to_string()));
        }

        let sequences = items.iter().map(|i| i.sequence).collect::<Vec<_>>();
        let removed = sqlx::query(
            "DELETE FROM items WHERE opportunity_id = $1 AND NOT (sequence = ANY($2))",
        )
        .bind(control_number)
        .bind(&sequences[..])
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed > 0 {
            debug!(control_number, removed, "dropped items no longer listed upstream");
        }

        for item in items {
            let award = item.award.clone().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO items (
                    opportunity_id, sequence, description, quantity, unit,
                    estimated_unit_value, estimated_total_value, has_result, is_relevant,
                    vocabulary_version, winner_id, winner_name, awarded_unit_value, awarded_total_value
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (opportunity_id, sequence) DO UPDATE
                   SET description = EXCLUDED.description,
                       quantity = EXCLUDED.quantity,
                       unit = EXCLUDED.unit,
                       estimated_unit_value = EXCLUDED.estimated_unit_value,
                       estimated_total_value = EXCLUDED.estimated_total_value,
                       has_result = EXCLUDED.has_result,
                       is_relevant = EXCLUDED.is_relevant,
                       vocabulary_version = EXCLUDED.vocabulary_version,
                       winner_id = COALESCE(EXCLUDED.winner_id, items.winner_id),
                       winner_name = COALESCE(EXCLUDED.winner_name, items.winner_name),
                       awarded_unit_value = COALESCE(EXCLUDED.awarded_unit_value, items.awarded_unit_value),
                       awarded_total_value = COALESCE(EXCLUDED.awarded_total_value, items.awarded_total_value),
                       updated_at = NOW()
                "#,
            )
            .bind(control_number)
            .bind(item.sequence)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(&item.unit)
            .bind(item.estimated_unit_value)
            .bind(item.estimated_total_value)
            .bind(item.has_result)
            .bind(item.is_relevant)
            .bind(vocabulary_version)
            .bind(&award.winner_id)
            .bind(&award.winner_name)
            .bind(award.unit_value)
            .bind(award.total_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(items.len())
    }

    async fn processing_record(
        &self,
        control_number: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT control_number, stage, has_relevant_item, items_total, items_relevant,
                   vocabulary_version, processed_at
              FROM processing_status
             WHERE control_number = $1
            "#,
        )
        .bind(control_number)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stage_label: String = row.try_get("stage")?;
        let stage = ProcessingStage::parse(&stage_label).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown stage {stage_label:?} for {control_number}"))
        })?;
        let items_total: i32 = row.try_get("items_total")?;
        let items_relevant: i32 = row.try_get("items_relevant")?;
        let processed_at: DateTime<Utc> = row.try_get("processed_at")?;

        Ok(Some(ProcessingRecord {
            control_number: row.try_get("control_number")?,
            outcome: ProcessingOutcome {
                stage,
                has_relevant_item: row.try_get("has_relevant_item")?,
                items_total: u32::try_from(items_total).unwrap_or(0),
                items_relevant: u32::try_from(items_relevant).unwrap_or(0),
                vocabulary_version: row.try_get("vocabulary_version")?,
            },
            processed_at,
        }))
    }

    async fn mark_processed(
        &self,
        control_number: &str,
        outcome: &ProcessingOutcome,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processing_status (
                control_number, stage, has_relevant_item, items_total, items_relevant,
                vocabulary_version, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (control_number) DO UPDATE
               SET stage = EXCLUDED.stage,
                   has_relevant_item = EXCLUDED.has_relevant_item,
                   items_total = EXCLUDED.items_total,
                   items_relevant = EXCLUDED.items_relevant,
                   vocabulary_version = EXCLUDED.vocabulary_version,
                   processed_at = EXCLUDED.processed_at
             WHERE (processing_status.stage, processing_status.has_relevant_item,
                    processing_status.items_total, processing_status.items_relevant,
                    processing_status.vocabulary_version)
                   IS DISTINCT FROM
                   (EXCLUDED.stage, EXCLUDED.has_relevant_item, EXCLUDED.items_total,
                    EXCLUDED.items_relevant, EXCLUDED.vocabulary_version)
            "#,
        )
        .bind(control_number)
        .bind(outcome.stage.as_str())
        .bind(outcome.has_relevant_item)
        .bind(count_to_db(outcome.items_total))
        .bind(count_to_db(outcome.items_relevant))
        .bind(&outcome.vocabulary_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredItem {
    item: Item,
    vocabulary_version: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    organizations: BTreeMap<String, Organization>,
    opportunities: BTreeMap<String, Opportunity>,
    items: BTreeMap<String, BTreeMap<i64, StoredItem>>,
    processing: BTreeMap<String, ProcessingRecord>,
    item_writes: usize,
}

/// In-process store with the same upsert semantics as `PgStore`. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn organization(&self, registration_id: &str) -> Option<Organization> {
        self.state.lock().await.organizations.get(registration_id).cloned()
    }

    pub async fn opportunity(&self, control_number: &str) -> Option<Opportunity> {
        self.state.lock().await.opportunities.get(control_number).cloned()
    }

    pub async fn opportunities(&self) -> Vec<Opportunity> {
        self.state.lock().await.opportunities.values().cloned().collect()
    }

    /// Items ordered by sequence.
    pub async fn items(&self, control_number: &str) -> Vec<Item> {
        self.state
            .lock()
            .await
            .items
            .get(control_number)
            .map(|rows| rows.values().map(|row| row.item.clone()).collect())
            .unwrap_or_default()
    }

    /// Every stored item keyed by (control number, sequence).
    pub async fn all_items(&self) -> BTreeMap<(String, i64), Item> {
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .flat_map(|(control, rows)| {
                rows.iter()
                    .map(move |(seq, row)| ((control.clone(), *seq), row.item.clone()))
            })
            .collect()
    }

    /// Vocabulary version an item was last classified with.
    pub async fn item_vocabulary_version(&self, control_number: &str, sequence: i64) -> Option<String> {
        self.state
            .lock()
            .await
            .items
            .get(control_number)
            .and_then(|rows| rows.get(&sequence))
            .map(|row| row.vocabulary_version.clone())
    }

    pub async fn processing_records(&self) -> Vec<ProcessingRecord> {
        self.state.lock().await.processing.values().cloned().collect()
    }

    /// Number of `upsert_items` calls that committed.
    pub async fn item_writes(&self) -> usize {
        self.state.lock().await.item_writes
    }
}

fn merge_award(new: Option<ItemAward>, old: Option<&ItemAward>) -> Option<ItemAward> {
    match (new, old) {
        (None, old) => old.cloned(),
        (Some(new), None) => Some(new),
        (Some(new), Some(old)) => Some(ItemAward {
            winner_id: new.winner_id.or_else(|| old.winner_id.clone()),
            winner_name: new.winner_name.or_else(|| old.winner_name.clone()),
            unit_value: new.unit_value.or(old.unit_value),
            total_value: new.total_value.or(old.total_value),
        }),
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert_organization(&self, organization: &Organization) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let merged = match state.organizations.get(&organization.registration_id) {
            Some(existing) => Organization {
                registration_id: organization.registration_id.clone(),
                name: if organization.name.is_empty() {
                    existing.name.clone()
                } else {
                    organization.name.clone()
                },
                jurisdiction: if organization.jurisdiction == JurisdictionLevel::Unknown {
                    existing.jurisdiction
                } else {
                    organization.jurisdiction
                },
                sector: organization.sector.clone().or_else(|| existing.sector.clone()),
                state_code: organization
                    .state_code
                    .clone()
                    .or_else(|| existing.state_code.clone()),
            },
            None => organization.clone(),
        };
        state
            .organizations
            .insert(organization.registration_id.clone(), merged);
        Ok(())
    }

    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state
            .organizations
            .contains_key(&opportunity.reference.organization_id)
        {
            return Err(StoreError::MissingOrganization(
                opportunity.reference.organization_id.clone(),
            ));
        }
        let mut next = opportunity.clone();
        if let Some(existing) = state.opportunities.get(&opportunity.control_number) {
            next.published_at = next.published_at.or(existing.published_at);
            next.estimated_value = next.estimated_value.or(existing.estimated_value);
            next.awarded_value = next.awarded_value.or(existing.awarded_value);
            next.modality = next.modality.or(existing.modality);
            next.municipality_code = next
                .municipality_code
                .or_else(|| existing.municipality_code.clone());
        }
        state
            .opportunities
            .insert(opportunity.control_number.clone(), next);
        Ok(())
    }

    async fn upsert_items(
        &self,
        control_number: &str,
        items: &[Item],
        vocabulary_version: &str,
    ) -> Result<usize, StoreError> {
        check_unique_sequences(control_number, items)?;

        let mut state = self.state.lock().await;
        if !state.opportunities.contains_key(control_number) {
            return Err(StoreError::MissingOpportunity(control_number.to_string()));
        }

        let previous = state.items.remove(control_number).unwrap_or_default();
        let rows = items
            .iter()
            .map(|item| {
                let mut item = item.clone();
                item.award = merge_award(
                    item.award.take(),
                    previous.get(&item.sequence).and_then(|p| p.item.award.as_ref()),
                );
                (
                    item.sequence,
                    StoredItem {
                        item,
                        vocabulary_version: vocabulary_version.to_string(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        state.items.insert(control_number.to_string(), rows);
        state.item_writes += 1;
        Ok(items.len())
    }

    async fn processing_record(
        &self,
        control_number: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .processing
            .get(control_number)
            .cloned())
    }

    async fn mark_processed(
        &self,
        control_number: &str,
        outcome: &ProcessingOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.processing.get(control_number) {
            if &existing.outcome == outcome {
                return Ok(());
            }
        }
        state.processing.insert(
            control_number.to_string(),
            ProcessingRecord {
                control_number: control_number.to_string(),
                outcome: outcome.clone(),
                processed_at: Utc::now(),
            },
        );
        Ok(())
    }
}
