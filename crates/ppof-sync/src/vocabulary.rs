//! Domain vocabulary loaded from YAML, and the keyword matcher shared by the pre-filter and
//! the item classifier.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("reading vocabulary {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing vocabulary: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid vocabulary: {0}")]
    Invalid(String),
}

/// How an opportunity's items are classified. Chosen per deployment, never inferred from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClassificationPolicy {
    /// Every item of every candidate is fetched and classified.
    Exhaustive,
    /// Classify the first `sample_size` items; reject without a full fetch when none match.
    Sampled { sample_size: usize },
}

impl ClassificationPolicy {
    pub fn label(&self) -> String {
        match self {
            Self::Exhaustive => "exhaustive".to_string(),
            Self::Sampled { sample_size } => format!("sampled({sample_size})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextualPhrase {
    /// Exact multi-word phrase.
    Phrase(String),
    /// Every term must occur somewhere in the text.
    AllOf { all_of: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub policy: ClassificationPolicy,
    pub core_terms: Vec<String>,
    #[serde(default)]
    pub contextual_phrases: Vec<ContextualPhrase>,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
}

impl Vocabulary {
    pub fn from_yaml_str(text: &str) -> Result<Self, VocabularyError> {
        let vocabulary: Vocabulary = serde_yaml::from_str(text)?;
        vocabulary.validate()?;
        Ok(vocabulary)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| VocabularyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<(), VocabularyError> {
        if self.version.trim().is_empty() {
            return Err(VocabularyError::Invalid("version must not be empty".into()));
        }
        if self.core_terms.is_empty() {
            return Err(VocabularyError::Invalid("core_terms must not be empty".into()));
        }
        if let ClassificationPolicy::Sampled { sample_size: 0 } = self.policy {
            return Err(VocabularyError::Invalid("sample_size must be at least 1".into()));
        }
        let blank = |t: &String| t.trim().is_empty();
        if self.core_terms.iter().any(blank) || self.exclude_terms.iter().any(blank) {
            return Err(VocabularyError::Invalid("terms must not be blank".into()));
        }
        for phrase in &self.contextual_phrases {
            let bad = match phrase {
                ContextualPhrase::Phrase(p) => p.trim().is_empty(),
                ContextualPhrase::AllOf { all_of } => all_of.is_empty() || all_of.iter().any(blank),
            };
            if bad {
                return Err(VocabularyError::Invalid(format!(
                    "contextual phrase {phrase:?} is empty"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContextRule {
    Phrase(String),
    AllOf(Vec<String>),
}

impl ContextRule {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Phrase(phrase) => text.contains(phrase.as_str()),
            Self::AllOf(terms) => terms.iter().all(|t| text.contains(t.as_str())),
        }
    }
}

/// Which tier of the vocabulary accepted a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordHit {
    Core(String),
    Contextual(String),
}

/// Lower-cased vocabulary; one instance backs both opportunity- and item-level checks.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    core_terms: Vec<String>,
    contextual: Vec<ContextRule>,
    exclude_terms: Vec<String>,
}

fn lower_all(terms: &[String]) -> Vec<String> {
    terms.iter().map(|t| t.trim().to_lowercase()).collect()
}

impl KeywordMatcher {
    pub fn new(vocabulary: &Vocabulary) -> Self {
        let contextual = vocabulary
            .contextual_phrases
            .iter()
            .map(|phrase| match phrase {
                ContextualPhrase::Phrase(p) => ContextRule::Phrase(p.trim().to_lowercase()),
                ContextualPhrase::AllOf { all_of } => ContextRule::AllOf(lower_all(all_of)),
            })
            .collect();
        Self {
            core_terms: lower_all(&vocabulary.core_terms),
            contextual,
            exclude_terms: lower_all(&vocabulary.exclude_terms),
        }
    }

    /// First hit over the already lower-cased text: core terms, then contextual phrases.
    pub fn first_hit(&self, lowered: &str) -> Option<KeywordHit> {
        if let Some(term) = self.core_terms.iter().find(|t| lowered.contains(t.as_str())) {
            return Some(KeywordHit::Core(term.clone()));
        }
        self.contextual
            .iter()
            .find(|rule| rule.matches(lowered))
            .map(|rule| match rule {
                ContextRule::Phrase(p) => KeywordHit::Contextual(p.clone()),
                ContextRule::AllOf(terms) => KeywordHit::Contextual(terms.join(" + ")),
            })
    }

    /// Pre-filter over title and description. No network, no exclusions.
    pub fn is_candidate(&self, title: &str, description: &str) -> bool {
        let text = format!("{} {}", title.to_lowercase(), description.to_lowercase());
        self.first_hit(&text).is_some()
    }

    pub fn is_excluded(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.exclude_terms.iter().any(|t| lowered.contains(t.as_str()))
    }

    /// Item-level check: the pre-filter on the description, vetoed by any exclude term.
    pub fn is_relevant_item(&self, description: &str) -> bool {
        self.is_candidate(description, "") && !self.is_excluded(description)
    }
}
