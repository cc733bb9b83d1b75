//! Multi-stage ranking: BM25 shortlist, embedding rescore, cross-encoder
//! rerank, then a domain-trust multiplier.
//!
//! Each stage monotonically narrows the candidate set. Ordering is total
//! and deterministic for fixed inputs and model versions; ties break on
//! page id, then fragment id.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::RankingConfig;
use crate::error::{Error, Result};
use crate::index::{cosine, EmbeddingIndex};
use crate::rpc::{EmbedClient, GenerateClient, RerankClient};
use crate::store::types::{DomainCategory, Fragment, NodeKind};
use crate::store::EvidenceStore;

/// A fragment that survived all ranking stages.
#[derive(Debug, Clone)]
pub struct RankedPassage {
    pub fragment: Fragment,
    pub bm25_score: f64,
    pub embedding_score: f64,
    pub rerank_score: f64,
    pub domain_category: DomainCategory,
    /// Rerank score multiplied by the domain-trust weight.
    pub final_score: f64,
}

/// Ranking engine over the fragment corpus.
pub struct RankingEngine {
    store: Arc<EvidenceStore>,
    index: Arc<EmbeddingIndex>,
    config: RankingConfig,
}

impl RankingEngine {
    pub fn new(store: Arc<EvidenceStore>, index: Arc<EmbeddingIndex>, config: RankingConfig) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    /// Select the passages that matter for `query_text`.
    ///
    /// Stage 1 pulls the BM25 pool from the full-text index, stage 2
    /// rescores it against the query embedding, stage 3 sends the shortlist
    /// through the cross-encoder. Fragments from blocked domains never
    /// enter the candidate set.
    pub async fn rank_passages(
        &self,
        query_text: &str,
        embed: &dyn EmbedClient,
        rerank: &dyn RerankClient,
    ) -> Result<Vec<RankedPassage>> {
        // Stage 1: BM25 pool.
        let pool = self
            .store
            .search_fragments_bm25(query_text, self.config.bm25_pool)?;
        if pool.is_empty() {
            return Ok(Vec::new());
        }
        debug!(candidates = pool.len(), "bm25 stage complete");

        // Resolve domain categories and drop blocked domains early.
        let mut candidates = Vec::with_capacity(pool.len());
        for (fragment, bm25_score) in pool {
            let page = self
                .store
                .get_page(&fragment.page_id)?
                .ok_or_else(|| Error::Fatal(format!("fragment {} has no page", fragment.id)))?;
            let category = self.store.domain_category(&page.domain)?;
            if category == DomainCategory::Blocked {
                continue;
            }
            candidates.push((fragment, bm25_score, category));
        }

        // Stage 2: embedding rescore.
        let query_vector = embed
            .embed(&[query_text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::rpc("embed", "endpoint returned no vectors"))?;

        let mut rescored: Vec<(Fragment, f64, f64, DomainCategory)> = Vec::new();
        for (fragment, bm25_score, category) in candidates {
            let embedding_score = match self
                .index
                .get_vector(NodeKind::Fragment, &fragment.id.to_string())?
            {
                Some(vector) => f64::from(cosine(&query_vector, &vector)),
                None => 0.0,
            };
            rescored.push((fragment, bm25_score, embedding_score, category));
        }
        rescored.sort_by(|a, b| descending_then_page(b.2, a.2, &a.0, &b.0));
        rescored.truncate(self.config.embedding_keep);
        debug!(candidates = rescored.len(), "embedding stage complete");

        // Stage 3: cross-encoder rerank.
        let passages: Vec<String> = rescored.iter().map(|(f, ..)| f.text.clone()).collect();
        let scores = rerank.rerank(query_text, &passages).await?;
        if scores.len() != passages.len() {
            return Err(Error::rpc(
                "rerank",
                format!("expected {} scores, got {}", passages.len(), scores.len()),
            ));
        }

        let mut ranked: Vec<RankedPassage> = rescored
            .into_iter()
            .zip(scores)
            .map(|((fragment, bm25_score, embedding_score, category), rerank_score)| {
                RankedPassage {
                    final_score: rerank_score * category.weight(),
                    fragment,
                    bm25_score,
                    embedding_score,
                    rerank_score,
                    domain_category: category,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            descending_then_page(b.final_score, a.final_score, &a.fragment, &b.fragment)
        });
        ranked.truncate(self.config.rerank_keep);

        // Persist the stage scores for later inspection.
        for passage in &ranked {
            self.store.update_fragment_scores(
                &passage.fragment.id,
                Some(passage.bm25_score),
                Some(passage.embedding_score),
                Some(passage.rerank_score),
            )?;
        }

        Ok(ranked)
    }

    /// Blend the citation-expansion scores: an LLM usefulness scalar, the
    /// embedding similarity, and a bibliographic impact score.
    pub fn blend_citation_score(&self, usefulness: f64, embedding: f64, impact: f64) -> f64 {
        self.config.usefulness_weight * usefulness.clamp(0.0, 1.0)
            + self.config.embedding_weight * embedding.clamp(0.0, 1.0)
            + self.config.impact_weight * impact.clamp(0.0, 1.0)
    }

    /// Ask the LLM how useful a candidate reference would be for testing
    /// the hypothesis. Returns a scalar in [0, 1]; unparseable output
    /// falls back to 0.5.
    pub async fn usefulness_score(
        &self,
        llm: &dyn GenerateClient,
        hypothesis: &str,
        candidate_summary: &str,
    ) -> Result<f64> {
        let prompt = usefulness_prompt(hypothesis, candidate_summary);
        let output = llm.generate(&prompt, None).await?;
        Ok(parse_scalar(&output).unwrap_or(0.5))
    }
}

/// Prompt for the citation-filter usefulness score.
pub fn usefulness_prompt(hypothesis: &str, candidate_summary: &str) -> String {
    format!(
        "You are screening references for a research review.\n\
         Hypothesis under investigation:\n{}\n\n\
         Candidate reference:\n{}\n\n\
         How useful would the full text of this reference be as evidence for \
         or against the hypothesis? Answer with a single decimal number \
         between 0 and 1 and nothing else.",
        hypothesis, candidate_summary
    )
}

fn parse_scalar(output: &str) -> Option<f64> {
    let token = output.split_whitespace().next()?;
    let value: f64 = token.trim_end_matches(['.', ',']).parse().ok()?;
    if value.is_finite() {
        Some(value.clamp(0.0, 1.0))
    } else {
        None
    }
}

/// Descending by score; ties resolved by page id, then fragment id, so the
/// order is total.
fn descending_then_page(score_b: f64, score_a: f64, a: &Fragment, b: &Fragment) -> Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.page_id
                .to_string()
                .cmp(&b.page_id.to_string())
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{MockEmbedClient, MockGenerateClient, MockRerankClient};
    use crate::store::types::*;
    use chrono::Utc;

    fn page(url: &str, domain: &str) -> Page {
        Page {
            id: PageId::new(),
            url: url.to_string(),
            domain: domain.to_string(),
            http_status: 200,
            content_hash: crate::canonical::text_hash(url),
            title: None,
            language: None,
            canonical_id: None,
            body_path: None,
            domain_category: DomainCategory::Unverified,
            fetched_at: Utc::now(),
        }
    }

    fn engine() -> (Arc<EvidenceStore>, Arc<EmbeddingIndex>, RankingEngine) {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let index = Arc::new(EmbeddingIndex::new(Arc::clone(&store), "test-model"));
        let engine = RankingEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            RankingConfig {
                bm25_pool: 10,
                embedding_keep: 5,
                rerank_keep: 2,
                ..RankingConfig::default()
            },
        );
        (store, index, engine)
    }

    #[tokio::test]
    async fn test_stages_narrow_and_order() {
        let (store, index, engine) = engine();
        let p = page("https://example.org/a", "example.org");
        let (page_id, _) = store.upsert_page(&p).unwrap();

        let frags = vec![
            Fragment::new(page_id.clone(), FragmentKind::Paragraph, 0, "aspirin lowered event rates"),
            Fragment::new(page_id.clone(), FragmentKind::Paragraph, 1, "aspirin dosing schedules vary"),
            Fragment::new(page_id.clone(), FragmentKind::Paragraph, 2, "aspirin chemistry overview"),
        ];
        store.insert_fragments(&frags).unwrap();
        index
            .store_vector(NodeKind::Fragment, &frags[0].id.to_string(), &[1.0, 0.0])
            .unwrap();
        index
            .store_vector(NodeKind::Fragment, &frags[1].id.to_string(), &[0.7, 0.7])
            .unwrap();
        index
            .store_vector(NodeKind::Fragment, &frags[2].id.to_string(), &[0.0, 1.0])
            .unwrap();

        let embed = MockEmbedClient::returning(vec![1.0, 0.0]);
        // Rerank prefers the second surviving passage.
        let rerank = MockRerankClient::with_scores(vec![0.2, 0.9]);

        let ranked = engine.rank_passages("aspirin", &embed, &rerank).await.unwrap();
        // rerank_keep = 2.
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].final_score >= ranked[1].final_score);
        // Scores were persisted.
        let stored = store.get_fragment(&ranked[0].fragment.id).unwrap().unwrap();
        assert!(stored.rerank_score.is_some());
    }

    #[tokio::test]
    async fn test_blocked_domains_are_excluded() {
        let (store, index, engine) = engine();
        let good = page("https://good.org/a", "good.org");
        let bad = page("https://bad.org/a", "bad.org");
        let (good_id, _) = store.upsert_page(&good).unwrap();
        let (bad_id, _) = store.upsert_page(&bad).unwrap();
        store.set_domain_category("bad.org", DomainCategory::Blocked).unwrap();

        let keep = Fragment::new(good_id, FragmentKind::Paragraph, 0, "aspirin trial evidence");
        let drop = Fragment::new(bad_id, FragmentKind::Paragraph, 0, "aspirin conspiracy theory");
        store.insert_fragments(&[keep.clone(), drop.clone()]).unwrap();
        for f in [&keep, &drop] {
            index
                .store_vector(NodeKind::Fragment, &f.id.to_string(), &[1.0, 0.0])
                .unwrap();
        }

        let embed = MockEmbedClient::returning(vec![1.0, 0.0]);
        let rerank = MockRerankClient::with_scores(vec![0.8]);

        let ranked = engine.rank_passages("aspirin", &embed, &rerank).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].fragment.id, keep.id);
    }

    #[tokio::test]
    async fn test_domain_weight_shapes_final_score() {
        let (store, index, engine) = engine();
        let primary = page("https://journal.org/a", "journal.org");
        let low = page("https://blog.net/a", "blog.net");
        store.set_domain_category("journal.org", DomainCategory::Primary).unwrap();
        store.set_domain_category("blog.net", DomainCategory::Low).unwrap();
        let (primary_id, _) = store.upsert_page(&primary).unwrap();
        let (low_id, _) = store.upsert_page(&low).unwrap();

        let from_primary =
            Fragment::new(primary_id, FragmentKind::Abstract, 0, "aspirin outcome data primary");
        let from_low = Fragment::new(low_id, FragmentKind::Paragraph, 0, "aspirin outcome data blog");
        store
            .insert_fragments(&[from_primary.clone(), from_low.clone()])
            .unwrap();
        for f in [&from_primary, &from_low] {
            index
                .store_vector(NodeKind::Fragment, &f.id.to_string(), &[1.0, 0.0])
                .unwrap();
        }

        let embed = MockEmbedClient::returning(vec![1.0, 0.0]);
        // Equal rerank scores: the domain weight decides.
        let rerank = MockRerankClient::with_scores(vec![0.9, 0.9]);

        let ranked = engine
            .rank_passages("aspirin outcome", &embed, &rerank)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].fragment.id, from_primary.id);
        assert!((ranked[0].final_score - 0.9 * 1.0).abs() < 1e-9);
        assert!((ranked[1].final_score - 0.9 * 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_corpus_yields_nothing() {
        let (_store, _index, engine) = engine();
        let embed = MockEmbedClient::returning(vec![1.0]);
        let rerank = MockRerankClient::with_scores(vec![]);
        let ranked = engine.rank_passages("anything", &embed, &rerank).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_citation_blend_weights() {
        let (_store, _index, engine) = engine();
        let blended = engine.blend_citation_score(1.0, 1.0, 1.0);
        assert!((blended - 1.0).abs() < 1e-9);

        let blended = engine.blend_citation_score(0.8, 0.5, 0.2);
        assert!((blended - (0.5 * 0.8 + 0.3 * 0.5 + 0.2 * 0.2)).abs() < 1e-9);

        // Out-of-range inputs are clamped, keeping the blend in [0, 1].
        let blended = engine.blend_citation_score(7.0, -3.0, 0.5);
        assert!((0.0..=1.0).contains(&blended));
    }

    #[tokio::test]
    async fn test_usefulness_score_parses_scalar() {
        let (_store, _index, engine) = engine();

        let llm = MockGenerateClient::returning("0.85");
        let score = engine.usefulness_score(&llm, "hypothesis", "summary").await.unwrap();
        assert!((score - 0.85).abs() < 1e-9);

        let llm = MockGenerateClient::returning("definitely useful!");
        let score = engine.usefulness_score(&llm, "hypothesis", "summary").await.unwrap();
        assert!((score - 0.5).abs() < 1e-9);

        let llm = MockGenerateClient::returning("1.7");
        let score = engine.usefulness_score(&llm, "hypothesis", "summary").await.unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_scalar_handles_trailing_punctuation() {
        assert_eq!(parse_scalar("0.6."), Some(0.6));
        assert_eq!(parse_scalar("0.25, roughly"), Some(0.25));
        assert_eq!(parse_scalar(""), None);
        assert_eq!(parse_scalar("NaN"), None);
    }
}
