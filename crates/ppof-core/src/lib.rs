//! Core domain model for PPOF (public procurement opportunity finder).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ppof-core";

/// Upstream free-text statuses that mean an opportunity is still accepting bids.
pub const ONGOING_STATUS_TERMS: &[&str] = &[
    "aberta",
    "open",
    "em andamento",
    "in progress",
    "publicada",
    "published",
    "vigente",
    "active",
    "em disputa",
    "aguardando propostas",
    "recebendo propostas",
];

/// Statuses where an award decision was made.
pub const AWARDED_STATUS_TERMS: &[&str] = &[
    "homologada",
    "homologado",
    "homologated",
    "adjudicada",
    "adjudicado",
    "adjudicated",
];

/// Statuses where the opportunity ended without (or before) an award.
pub const CLOSED_STATUS_TERMS: &[&str] = &[
    "concluída",
    "concluida",
    "concluido",
    "concluded",
    "completed",
    "finalizada",
    "finalizado",
    "cancelada",
    "cancelado",
    "cancelled",
    "deserta",
    "deserto",
    "fracassada",
    "fracassado",
    "revogada",
    "revogado",
    "suspensa",
];

/// Natural key of an opportunity on the upstream API: organization id / year / sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityRef {
    pub organization_id: String,
    pub year: i32,
    pub sequence: i64,
}

impl OpportunityRef {
    pub fn new(organization_id: impl AsRef<str>, year: i32, sequence: i64) -> Self {
        Self {
            organization_id: normalize_registration_id(organization_id.as_ref()),
            year,
            sequence,
        }
    }
}

impl fmt::Display for OpportunityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization_id, self.year, self.sequence)
    }
}

/// Strip punctuation from a tax/registration id so `12.345.678/0001-90` and
/// `12345678000190` key the same organization.
pub fn normalize_registration_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Open,
    Closed,
    Awarded,
}

impl OpportunityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Awarded => "awarded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "awarded" => Some(Self::Awarded),
            _ => None,
        }
    }

    /// Map an upstream status label into the closed enumeration.
    ///
    /// Awarded terms win over closed terms; an unknown label falls back to `awarded`
    /// when an awarded value is already known, otherwise `open`.
    pub fn from_source_label(label: Option<&str>, has_awarded_value: bool) -> Self {
        let lower = label.unwrap_or_default().trim().to_lowercase();
        if AWARDED_STATUS_TERMS.iter().any(|t| lower.contains(t)) {
            return Self::Awarded;
        }
        if CLOSED_STATUS_TERMS.iter().any(|t| lower.contains(t)) {
            return Self::Closed;
        }
        if ONGOING_STATUS_TERMS.iter().any(|t| lower.contains(t)) {
            return Self::Open;
        }
        if has_awarded_value {
            Self::Awarded
        } else {
            Self::Open
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionLevel {
    Federal,
    State,
    Municipal,
    District,
    Unknown,
}

impl JurisdictionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Federal => "federal",
            Self::State => "state",
            Self::Municipal => "municipal",
            Self::District => "district",
            Self::Unknown => "unknown",
        }
    }

    /// Single-letter sphere code used by the upstream API (`F`, `E`, `M`, `D`).
    pub fn from_sphere_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "F" => Some(Self::Federal),
            "E" => Some(Self::State),
            "M" => Some(Self::Municipal),
            "D" => Some(Self::District),
            _ => None,
        }
    }

    /// Keyword fallback over the organization display name.
    pub fn from_organization_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        const FEDERAL: &[&str] = &[
            "ministério",
            "ministerio",
            "federal",
            "união",
            "governo federal",
            "agência nacional",
            "instituto nacional",
        ];
        const STATE: &[&str] = &[
            "governo do estado",
            "secretaria de estado",
            "estado de",
            "estado do",
            "estadual",
        ];
        const MUNICIPAL: &[&str] = &[
            "município",
            "municipio",
            "prefeitura",
            "câmara municipal",
            "camara municipal",
            "municipal",
        ];

        if FEDERAL.iter().any(|k| lower.contains(k)) {
            Self::Federal
        } else if STATE.iter().any(|k| lower.contains(k)) {
            Self::State
        } else if MUNICIPAL.iter().any(|k| lower.contains(k)) {
            Self::Municipal
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
    Mega,
}

impl SizeBucket {
    pub fn for_value(value: f64) -> Self {
        if value < 50_000.0 {
            Self::Small
        } else if value < 500_000.0 {
            Self::Medium
        } else if value < 5_000_000.0 {
            Self::Large
        } else {
            Self::Mega
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Mega => "mega",
        }
    }
}

/// Buying organization, keyed by its registration id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub registration_id: String,
    pub name: String,
    pub jurisdiction: JurisdictionLevel,
    pub sector: Option<String>,
    pub state_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Source-assigned control number; the persisted natural key.
    pub control_number: String,
    pub reference: OpportunityRef,
    pub organization: Organization,
    pub title: String,
    pub description: String,
    pub status: OpportunityStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub estimated_value: Option<f64>,
    pub awarded_value: Option<f64>,
    pub modality: Option<i32>,
    pub municipality_code: Option<String>,
}

impl Opportunity {
    /// Value used for size bucketing and value filters: awarded if known, else estimated.
    pub fn reference_value(&self) -> f64 {
        self.awarded_value
            .filter(|v| *v > 0.0)
            .or(self.estimated_value)
            .unwrap_or(0.0)
    }

    pub fn size_bucket(&self) -> SizeBucket {
        SizeBucket::for_value(self.reference_value())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ItemAward {
    pub winner_id: Option<String>,
    pub winner_name: Option<String>,
    pub unit_value: Option<f64>,
    pub total_value: Option<f64>,
}

/// One line within an opportunity. `sequence` is unique per opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub sequence: i64,
    pub description: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub estimated_unit_value: Option<f64>,
    pub estimated_total_value: Option<f64>,
    /// Listing payload says an award result exists for this item.
    pub has_result: bool,
    pub is_relevant: bool,
    pub award: Option<ItemAward>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Discovered,
    Classified,
    Completed,
}

impl ProcessingStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Classified => "classified",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(Self::Discovered),
            "classified" => Some(Self::Classified),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// What the pipeline concluded about one opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub stage: ProcessingStage,
    pub has_relevant_item: bool,
    pub items_total: u32,
    pub items_relevant: u32,
    pub vocabulary_version: String,
}

/// Dedup key row: one per opportunity control number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub control_number: String,
    pub outcome: ProcessingOutcome,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn is_completed(&self) -> bool {
        self.outcome.stage == ProcessingStage::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_ids_normalize_to_alphanumerics() {
        assert_eq!(normalize_registration_id("12.345.678/0001-90"), "12345678000190");
        let a = OpportunityRef::new("12.345.678/0001-90", 2025, 7);
        let b = OpportunityRef::new("12345678000190", 2025, 7);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "12345678000190/2025/7");
    }

    #[test]
    fn status_labels_map_into_closed_enumeration() {
        assert_eq!(
            OpportunityStatus::from_source_label(Some("Divulgada no PNCP - Aberta"), false),
            OpportunityStatus::Open
        );
        assert_eq!(
            OpportunityStatus::from_source_label(Some("Homologada"), false),
            OpportunityStatus::Awarded
        );
        assert_eq!(
            OpportunityStatus::from_source_label(Some("Revogada"), false),
            OpportunityStatus::Closed
        );
        assert_eq!(
            OpportunityStatus::from_source_label(None, true),
            OpportunityStatus::Awarded
        );
        assert_eq!(
            OpportunityStatus::from_source_label(Some("???"), false),
            OpportunityStatus::Open
        );
    }

    #[test]
    fn status_round_trips_through_its_label() {
        for status in [
            OpportunityStatus::Open,
            OpportunityStatus::Closed,
            OpportunityStatus::Awarded,
        ] {
            assert_eq!(OpportunityStatus::parse(status.as_str()), Some(status));
        }
        let json = serde_json::to_string(&OpportunityStatus::Awarded).unwrap();
        assert_eq!(json, "\"awarded\"");
    }

    #[test]
    fn jurisdiction_prefers_sphere_code_then_name() {
        assert_eq!(JurisdictionLevel::from_sphere_code("m"), Some(JurisdictionLevel::Municipal));
        assert_eq!(JurisdictionLevel::from_sphere_code("X"), None);
        assert_eq!(
            JurisdictionLevel::from_organization_name("PREFEITURA MUNICIPAL DE CAMPINAS"),
            JurisdictionLevel::Municipal
        );
        assert_eq!(
            JurisdictionLevel::from_organization_name("Ministério da Saúde"),
            JurisdictionLevel::Federal
        );
        assert_eq!(
            JurisdictionLevel::from_organization_name("Companhia de Saneamento"),
            JurisdictionLevel::Unknown
        );
    }

    #[test]
    fn size_buckets_follow_value_thresholds() {
        assert_eq!(SizeBucket::for_value(49_999.99), SizeBucket::Small);
        assert_eq!(SizeBucket::for_value(50_000.0), SizeBucket::Medium);
        assert_eq!(SizeBucket::for_value(4_999_999.0), SizeBucket::Large);
        assert_eq!(SizeBucket::for_value(10_000_000.0), SizeBucket::Mega);
    }
}
