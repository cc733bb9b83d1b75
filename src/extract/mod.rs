//! Extraction engine: fetched pages into fragments and claims.
//!
//! The pipeline segments page text, persists fragments, ranks them against
//! the task hypothesis, asks the remote LLM for claims over the selected
//! passages, and records provenance edges for everything it accepts.

pub mod claims;
pub mod sanitize;
pub mod segment;

pub use claims::{claim_schema, extraction_prompt, parse_claims, ExtractedClaim};
pub use sanitize::{has_implausible_url, normalize, Sanitizer};
pub use segment::{segment_page, SegmentedBlock};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::index::EmbeddingIndex;
use crate::rank::{RankedPassage, RankingEngine};
use crate::rpc::{EmbedClient, GenerateClient};
use crate::store::types::*;
use crate::store::EvidenceStore;

/// Extraction engine over one store.
pub struct ExtractionEngine {
    store: Arc<EvidenceStore>,
    index: Arc<EmbeddingIndex>,
    ranking: Arc<RankingEngine>,
    config: ExtractionConfig,
}

impl ExtractionEngine {
    pub fn new(
        store: Arc<EvidenceStore>,
        index: Arc<EmbeddingIndex>,
        ranking: Arc<RankingEngine>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            index,
            ranking,
            config,
        }
    }

    /// The ranking engine this pipeline selects passages with.
    pub fn ranking(&self) -> &Arc<RankingEngine> {
        &self.ranking
    }

    /// Segment a page body into fragments, persist them, and embed the ones
    /// that are new. Returns the newly inserted fragments.
    pub async fn ingest_page(
        &self,
        page_id: &PageId,
        body: &str,
        abstract_text: Option<&str>,
        embed: &dyn EmbedClient,
    ) -> Result<Vec<Fragment>> {
        let blocks = segment_page(body, abstract_text);
        let fragments: Vec<Fragment> = blocks
            .into_iter()
            .map(|block| {
                let mut fragment = Fragment::new(
                    page_id.clone(),
                    block.kind,
                    block.position,
                    normalize(&block.text),
                );
                if let Some(context) = block.heading_context {
                    fragment = fragment.with_heading_context(context);
                }
                fragment
            })
            .collect();

        let inserted = self.store.insert_fragments(&fragments)?;
        debug!(
            page = %page_id,
            segmented = fragments.len(),
            inserted = inserted.len(),
            "page ingested"
        );

        for fragment in &inserted {
            self.index
                .embed_and_store(embed, NodeKind::Fragment, &fragment.id.to_string(), &fragment.text)
                .await?;
        }
        Ok(inserted)
    }

    /// Rank a task's corpus against its hypothesis and return the passage
    /// set claim extraction will run over.
    pub async fn select_passages(
        &self,
        task: &Task,
        embed: &dyn EmbedClient,
        rerank: &dyn crate::rpc::RerankClient,
    ) -> Result<Vec<RankedPassage>> {
        let mut passages = self
            .ranking
            .rank_passages(&task.hypothesis, embed, rerank)
            .await?;
        passages.truncate(self.config.max_passages);
        Ok(passages)
    }

    /// Extract claims for a page from the selected passages.
    ///
    /// The LLM call is retried with exponential backoff while its output
    /// fails validation; each failed attempt lands in the extraction-error
    /// table. After the attempt budget the page is skipped.
    pub async fn extract_claims(
        &self,
        task: &Task,
        page_id: &PageId,
        passages: &[RankedPassage],
        llm: &dyn GenerateClient,
        embed: &dyn EmbedClient,
    ) -> Result<Vec<Claim>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let sanitizer = Sanitizer::new_session();
        let texts: Vec<String> = passages.iter().map(|p| p.fragment.text.clone()).collect();
        let prompt = extraction_prompt(&task.hypothesis, &texts, &sanitizer);
        let schema = claim_schema();

        let mut extracted = None;
        let mut attempt = 0u32;
        while attempt < self.config.max_attempts {
            attempt += 1;
            let output = llm.generate(&prompt, Some(&schema)).await;
            match output {
                Ok(output) => match parse_claims(&output, texts.len(), &sanitizer) {
                    Ok(claims) => {
                        extracted = Some(claims);
                        break;
                    }
                    Err(e) => {
                        warn!(page = %page_id, attempt, error = %e, "extraction output rejected");
                        self.store
                            .record_extraction_error(page_id, attempt, &e.to_string())?;
                    }
                },
                Err(e) if e.retryable() => {
                    warn!(page = %page_id, attempt, error = %e, "extraction call failed");
                    self.store
                        .record_extraction_error(page_id, attempt, &e.to_string())?;
                }
                Err(e) => return Err(e),
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        let Some(mut extracted) = extracted else {
            return Err(Error::Extraction(format!(
                "page {} skipped after {} attempts",
                page_id, attempt
            )));
        };
        extracted.truncate(self.config.max_claims_per_page);

        let mut stored = Vec::with_capacity(extracted.len());
        for item in extracted {
            let origins: Vec<FragmentId> = item
                .passage_indices
                .iter()
                .map(|i| passages[*i].fragment.id.clone())
                .collect();

            let claim = Claim::new(task.id.clone(), item.claim_text, item.llm_claim_confidence)
                .with_granularity(item.granularity)
                .with_polarity(item.polarity);
            self.store.insert_claim(&claim, &origins)?;
            self.index
                .embed_and_store(embed, NodeKind::Claim, &claim.id.to_string(), &claim.text)
                .await?;
            stored.push(claim);
        }

        info!(page = %page_id, claims = stored.len(), "claims extracted");
        Ok(stored)
    }

    /// The NLI candidate set after extraction: every new claim paired with
    /// every retrieved candidate fragment, minus pairs already verified.
    pub fn nli_candidates(
        &self,
        new_claims: &[Claim],
        candidate_fragments: &[RankedPassage],
    ) -> Result<Vec<(FragmentId, ClaimId)>> {
        let mut pairs = Vec::new();
        for claim in new_claims {
            for passage in candidate_fragments {
                if !self
                    .store
                    .nli_verdict_exists(&passage.fragment.id, &claim.id)?
                {
                    pairs.push((passage.fragment.id.clone(), claim.id.clone()));
                }
            }
        }
        Ok(pairs)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let millis = 200u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RankingConfig;
    use crate::rpc::{MockEmbedClient, MockGenerateClient};
    use chrono::Utc;
    use serde_json::json;

    fn fixture() -> (Arc<EvidenceStore>, Arc<EmbeddingIndex>, ExtractionEngine, Task, PageId) {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let index = Arc::new(EmbeddingIndex::new(Arc::clone(&store), "test-model"));
        let ranking = Arc::new(RankingEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            RankingConfig::default(),
        ));
        let engine = ExtractionEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            ranking,
            ExtractionConfig {
                max_attempts: 3,
                max_passages: 8,
                max_claims_per_page: 12,
            },
        );

        let task = Task::new("aspirin reduces cardiovascular events", TaskBudget::new(10, 600));
        store.insert_task(&task).unwrap();

        let page = Page {
            id: PageId::new(),
            url: "https://example.org/aspirin".to_string(),
            domain: "example.org".to_string(),
            http_status: 200,
            content_hash: "h".to_string(),
            title: None,
            language: None,
            canonical_id: None,
            body_path: None,
            domain_category: DomainCategory::Academic,
            fetched_at: Utc::now(),
        };
        let (page_id, _) = store.upsert_page(&page).unwrap();
        (store, index, engine, task, page_id)
    }

    fn ranked(fragment: Fragment) -> RankedPassage {
        RankedPassage {
            fragment,
            bm25_score: 1.0,
            embedding_score: 0.9,
            rerank_score: 0.8,
            domain_category: DomainCategory::Academic,
            final_score: 0.68,
        }
    }

    const BODY: &str = "\
# Findings

Aspirin reduced nonfatal myocardial infarction by a fifth in the pooled analysis of trials.

Bleeding risk increased modestly across every aspirin arm in the pooled data.
";

    #[tokio::test]
    async fn test_ingest_page_persists_and_embeds() {
        let (store, index, engine, _task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.5, 0.5]);

        let inserted = engine
            .ingest_page(&page_id, BODY, None, &embed)
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2);
        assert_eq!(store.fragments_for_page(&page_id).unwrap().len(), 2);
        for fragment in &inserted {
            assert!(index
                .get_vector(NodeKind::Fragment, &fragment.id.to_string())
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (store, _index, engine, _task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.5]);

        let first = engine.ingest_page(&page_id, BODY, None, &embed).await.unwrap();
        let second = engine.ingest_page(&page_id, BODY, None, &embed).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(store.fragments_for_page(&page_id).unwrap().len(), 2);
    }

    fn extraction_output(text: &str) -> String {
        json!({
            "claims": [{
                "claim_text": text,
                "llm_claim_confidence": 0.87,
                "polarity": "positive",
                "granularity": "atomic",
                "passage_indices": [0]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_extract_claims_records_provenance() {
        let (store, index, engine, task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.1, 0.2]);

        let fragment = Fragment::new(page_id.clone(), FragmentKind::Paragraph, 0, "trial evidence text");
        store.insert_fragments(std::slice::from_ref(&fragment)).unwrap();
        let passages = vec![ranked(fragment.clone())];

        let llm = MockGenerateClient::returning(extraction_output(
            "Aspirin reduces nonfatal myocardial infarction in adults.",
        ));
        let claims = engine
            .extract_claims(&task, &page_id, &passages, &llm, &embed)
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);

        let edges = store.edges_for_claim(&claims[0].id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, EdgeRelation::Origin);
        assert_eq!(edges[0].source_id, fragment.id.to_string());

        // The claim got a vector.
        assert!(index
            .get_vector(NodeKind::Claim, &claims[0].id.to_string())
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_extract_retries_then_succeeds() {
        let (store, _index, engine, task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.1]);

        let fragment = Fragment::new(page_id.clone(), FragmentKind::Paragraph, 0, "evidence text here");
        store.insert_fragments(std::slice::from_ref(&fragment)).unwrap();
        let passages = vec![ranked(fragment)];

        let llm = MockGenerateClient::with_responses(vec![
            "not json at all".to_string(),
            extraction_output("Aspirin reduces vascular events across pooled trials."),
        ]);
        let claims = engine
            .extract_claims(&task, &page_id, &passages, &llm, &embed)
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_extract_gives_up_after_attempts() {
        let (store, _index, engine, task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.1]);

        let fragment = Fragment::new(page_id.clone(), FragmentKind::Paragraph, 0, "evidence text here");
        store.insert_fragments(std::slice::from_ref(&fragment)).unwrap();
        let passages = vec![ranked(fragment)];

        let llm = MockGenerateClient::returning("still not json");
        let err = engine
            .extract_claims(&task, &page_id, &passages, &llm, &embed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_nli_candidates_skip_verified_pairs() {
        let (store, _index, engine, task, page_id) = fixture();
        let embed = MockEmbedClient::returning(vec![0.1]);

        let fragment = Fragment::new(page_id.clone(), FragmentKind::Paragraph, 0, "evidence text here");
        store.insert_fragments(std::slice::from_ref(&fragment)).unwrap();
        let passages = vec![ranked(fragment.clone())];

        let llm = MockGenerateClient::returning(extraction_output(
            "Aspirin reduces vascular events in pooled analyses.",
        ));
        let claims = engine
            .extract_claims(&task, &page_id, &passages, &llm, &embed)
            .await
            .unwrap();

        let pairs = engine.nli_candidates(&claims, &passages).unwrap();
        assert_eq!(pairs.len(), 1);

        // Verify the pair, then it drops out of the candidate set.
        store
            .insert_edge(
                &Edge::nli(&fragment.id, &claims[0].id, EdgeRelation::Supports, 0.9).unwrap(),
            )
            .unwrap();
        let pairs = engine.nli_candidates(&claims, &passages).unwrap();
        assert!(pairs.is_empty());
    }
}
