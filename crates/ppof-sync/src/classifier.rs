//! Item classification strategies.

use std::sync::Arc;

use async_trait::async_trait;
use ppof_adapters::{DetailFetcher, SourceError};
use ppof_core::{Item, OpportunityRef};
use tracing::debug;

use crate::vocabulary::{ClassificationPolicy, KeywordMatcher};

/// Items examined for one opportunity, each carrying its relevance flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub items: Vec<Item>,
    pub relevant: usize,
    /// True when only a sample was read and the opportunity was rejected on it.
    pub rejected_on_sample: bool,
}

impl Classification {
    fn from_items(items: Vec<Item>, rejected_on_sample: bool) -> Self {
        let relevant = items.iter().filter(|i| i.is_relevant).count();
        Self {
            items,
            relevant,
            rejected_on_sample,
        }
    }

    pub fn has_relevant_item(&self) -> bool {
        self.relevant > 0
    }

    pub fn relevant_items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|i| i.is_relevant)
    }
}

/// Set `is_relevant` on every item from its description.
pub fn flag_items(matcher: &KeywordMatcher, mut items: Vec<Item>) -> Vec<Item> {
    for item in &mut items {
        item.is_relevant = matcher.is_relevant_item(&item.description);
    }
    items
}

#[async_trait]
pub trait ItemClassifier: Send + Sync {
    fn policy(&self) -> ClassificationPolicy;

    async fn classify(
        &self,
        details: &DetailFetcher,
        opportunity: &OpportunityRef,
    ) -> Result<Classification, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ExhaustiveClassifier {
    matcher: Arc<KeywordMatcher>,
}

impl ExhaustiveClassifier {
    pub fn new(matcher: Arc<KeywordMatcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl ItemClassifier for ExhaustiveClassifier {
    fn policy(&self) -> ClassificationPolicy {
        ClassificationPolicy::Exhaustive
    }

    async fn classify(
        &self,
        details: &DetailFetcher,
        opportunity: &OpportunityRef,
    ) -> Result<Classification, SourceError> {
        let items = details.get_items_all(opportunity).await?;
        Ok(Classification::from_items(flag_items(&self.matcher, items), false))
    }
}

#[derive(Debug, Clone)]
pub struct SampledClassifier {
    matcher: Arc<KeywordMatcher>,
    sample_size: usize,
}

impl SampledClassifier {
    pub fn new(matcher: Arc<KeywordMatcher>, sample_size: usize) -> Self {
        Self {
            matcher,
            sample_size: sample_size.max(1),
        }
    }
}

#[async_trait]
impl ItemClassifier for SampledClassifier {
    fn policy(&self) -> ClassificationPolicy {
        ClassificationPolicy::Sampled {
            sample_size: self.sample_size,
        }
    }

    async fn classify(
        &self,
        details: &DetailFetcher,
        opportunity: &OpportunityRef,
    ) -> Result<Classification, SourceError> {
        let sample = flag_items(
            &self.matcher,
            details.sample_items(opportunity, self.sample_size).await?,
        );
        if !sample.iter().any(|i| i.is_relevant) {
            debug!(%opportunity, sampled = sample.len(), "no sampled item matched; skipping full item fetch");
            return Ok(Classification::from_items(sample, true));
        }
        let items = details.get_items_all(opportunity).await?;
        Ok(Classification::from_items(flag_items(&self.matcher, items), false))
    }
}

pub fn classifier_for(
    policy: ClassificationPolicy,
    matcher: Arc<KeywordMatcher>,
) -> Arc<dyn ItemClassifier> {
    match policy {
        ClassificationPolicy::Exhaustive => Arc::new(ExhaustiveClassifier::new(matcher)),
        ClassificationPolicy::Sampled { sample_size } => {
            Arc::new(SampledClassifier::new(matcher, sample_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ppof_adapters::{ListingQuery, Page, ProcurementApi};
    use serde_json::json;

    use crate::vocabulary::Vocabulary;

    /// 100 items; only 90..=95 mention the domain term.
    struct HundredItems {
        item_pages: AtomicUsize,
    }

    #[async_trait]
    impl ProcurementApi for HundredItems {
        async fn listing_page(&self, _query: &ListingQuery, _page: u32) -> Result<Page, SourceError> {
            Ok(Page::default())
        }

        async fn items_page(
            &self,
            _opportunity: &OpportunityRef,
            page: u32,
            page_size: u32,
        ) -> Result<Page, SourceError> {
            self.item_pages.fetch_add(1, Ordering::SeqCst);
            let start = (page as usize - 1) * page_size as usize + 1;
            let records = (start..start + page_size as usize)
                .filter(|n| *n <= 100)
                .map(|n| {
                    let description = if (90..=95).contains(&n) {
                        format!("Lacre de segurança numerado, lote {n}")
                    } else {
                        format!("Material de escritório, lote {n}")
                    };
                    json!({ "numeroItem": n, "descricao": description })
                })
                .collect();
            Ok(Page { records, remaining: None })
        }

        async fn item_results(
            &self,
            _opportunity: &OpportunityRef,
            _item_number: i64,
        ) -> Result<Option<Page>, SourceError> {
            Ok(None)
        }
    }

    fn setup() -> (Arc<HundredItems>, DetailFetcher, Arc<KeywordMatcher>) {
        let api = Arc::new(HundredItems {
            item_pages: AtomicUsize::new(0),
        });
        let details = DetailFetcher::new(api.clone(), 20).with_item_page_size(25);
        let vocab = Vocabulary::from_yaml_str(
            "version: t\npolicy: { mode: exhaustive }\ncore_terms: [lacre]\n",
        )
        .unwrap();
        (api, details, Arc::new(KeywordMatcher::new(&vocab)))
    }

    #[tokio::test]
    async fn exhaustive_finds_every_sparse_relevant_item() {
        let (api, details, matcher) = setup();
        let opp = OpportunityRef::new("1", 2025, 1);
        let result = classifier_for(ClassificationPolicy::Exhaustive, matcher)
            .classify(&details, &opp)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 100);
        assert_eq!(result.relevant, 6);
        assert_eq!(
            result.relevant_items().map(|i| i.sequence).collect::<Vec<_>>(),
            vec![90, 91, 92, 93, 94, 95]
        );
        assert!(result.has_relevant_item());
        // 4 full pages plus the empty page that ends the walk
        assert_eq!(api.item_pages.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn sampling_rejects_on_an_irrelevant_prefix() {
        let (api, details, matcher) = setup();
        let opp = OpportunityRef::new("1", 2025, 1);
        let classifier = classifier_for(ClassificationPolicy::Sampled { sample_size: 3 }, matcher);
        let result = classifier.classify(&details, &opp).await.unwrap();
        assert_eq!(result.relevant, 0);
        assert!(!result.has_relevant_item());
        assert!(result.rejected_on_sample);
        assert_eq!(result.items.len(), 3);
        assert_eq!(api.item_pages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sampling_accepts_and_fetches_everything_on_a_hit() {
        let (api, details, _) = setup();
        let vocab = Vocabulary::from_yaml_str(
            "version: t\npolicy: { mode: sampled, sample_size: 3 }\ncore_terms: [escritório, lacre]\n",
        )
        .unwrap();
        let matcher = Arc::new(KeywordMatcher::new(&vocab));
        let result = classifier_for(vocab.policy, matcher)
            .classify(&details, &OpportunityRef::new("1", 2025, 1))
            .await
            .unwrap();
        assert!(!result.rejected_on_sample);
        assert_eq!(result.items.len(), 100);
        assert_eq!(result.relevant, 100);
        assert_eq!(api.item_pages.load(Ordering::SeqCst), 1 + 5);
    }
}
