//! Search-provider registry.
//!
//! Providers form a closed set with a shared capability trait; the actual
//! engine adapters (HTML parsers, academic APIs) live outside the core and
//! are injected. Configuration supplies an ordered priority list and the
//! circuit-breaker registry filters it at dispatch time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::scheduler::BreakerRegistry;

/// The closed set of search providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Web,
    SemanticScholar,
    OpenAlex,
    Arxiv,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "web" => Ok(Self::Web),
            "semantic_scholar" => Ok(Self::SemanticScholar),
            "openalex" => Ok(Self::OpenAlex),
            "arxiv" => Ok(Self::Arxiv),
            other => Err(Error::invalid_input(format!("bad provider {:?}", other))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Web => "web",
            Self::SemanticScholar => "semantic_scholar",
            Self::OpenAlex => "openalex",
            Self::Arxiv => "arxiv",
        };
        write!(f, "{}", s)
    }
}

/// One search-engine result as the backend reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// One entry of a paper's reference or citation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceHit {
    /// Canonical work id (doi:, pmid:, arxiv:, title:).
    pub canonical_id: String,
    pub title: String,
    pub year: Option<i32>,
    /// How often the referenced work is cited, when the provider knows.
    pub citation_count: Option<u32>,
}

/// Capabilities shared by every provider.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Ranked results for a query.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Works a paper references. Providers without a citation graph return
    /// empty.
    async fn references(&self, canonical_id: &str) -> Result<Vec<ReferenceHit>> {
        let _ = canonical_id;
        Ok(Vec::new())
    }

    /// Works citing a paper.
    async fn citations(&self, canonical_id: &str) -> Result<Vec<ReferenceHit>> {
        let _ = canonical_id;
        Ok(Vec::new())
    }
}

/// Ordered provider list filtered by runtime health.
pub struct ProviderRegistry {
    providers: Vec<(ProviderKind, Arc<dyn SearchBackend>)>,
    breakers: Arc<BreakerRegistry>,
}

impl ProviderRegistry {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            providers: Vec::new(),
            breakers,
        }
    }

    /// Append a provider; registration order is priority order.
    pub fn register(&mut self, kind: ProviderKind, backend: Arc<dyn SearchBackend>) {
        self.providers.push((kind, backend));
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn scope(kind: ProviderKind) -> String {
        format!("provider:{}", kind)
    }

    /// Search with the first healthy provider that answers; providers with
    /// open circuits are skipped, and failures feed their breakers.
    pub async fn search(&self, query: &str, limit: usize) -> Result<(ProviderKind, Vec<SearchHit>)> {
        let mut last_err = None;
        for (kind, backend) in &self.providers {
            let scope = Self::scope(*kind);
            if !self.breakers.allow_request(&scope) {
                continue;
            }
            match backend.search(query, limit).await {
                Ok(hits) => {
                    self.breakers.record_success(&scope);
                    return Ok((*kind, hits));
                }
                Err(e) => {
                    let captcha = matches!(e, Error::AuthRequired { .. });
                    self.breakers.record_failure(&scope, captcha);
                    warn!(provider = %kind, error = %e, "provider search failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::transient("no healthy search provider")))
    }

    /// Reference list for a work from the first provider that has one.
    pub async fn references(&self, canonical_id: &str) -> Result<Vec<ReferenceHit>> {
        for (kind, backend) in &self.providers {
            let scope = Self::scope(*kind);
            if !self.breakers.allow_request(&scope) {
                continue;
            }
            match backend.references(canonical_id).await {
                Ok(refs) if !refs.is_empty() => {
                    self.breakers.record_success(&scope);
                    return Ok(refs);
                }
                Ok(_) => {
                    self.breakers.record_success(&scope);
                }
                Err(e) => {
                    self.breakers.record_failure(&scope, false);
                    warn!(provider = %kind, error = %e, "provider references failed");
                }
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticBackend {
        hits: Vec<SearchHit>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StaticBackend {
        fn new(urls: &[&str]) -> Self {
            Self {
                hits: urls
                    .iter()
                    .map(|u| SearchHit {
                        url: u.to_string(),
                        title: "t".to_string(),
                        snippet: "s".to_string(),
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                hits: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl SearchBackend for StaticBackend {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::transient("backend down"))
            } else {
                Ok(self.hits.clone())
            }
        }
    }

    fn registry() -> (Arc<BreakerRegistry>, ProviderRegistry) {
        let breakers = Arc::new(BreakerRegistry::new(2, 1800));
        let registry = ProviderRegistry::new(Arc::clone(&breakers));
        (breakers, registry)
    }

    #[tokio::test]
    async fn test_priority_order_wins() {
        let (_breakers, mut registry) = registry();
        registry.register(
            ProviderKind::SemanticScholar,
            Arc::new(StaticBackend::new(&["https://scholar.example/1"])),
        );
        registry.register(
            ProviderKind::Web,
            Arc::new(StaticBackend::new(&["https://web.example/1"])),
        );

        let (kind, hits) = registry.search("aspirin", 10).await.unwrap();
        assert_eq!(kind, ProviderKind::SemanticScholar);
        assert_eq!(hits[0].url, "https://scholar.example/1");
    }

    #[tokio::test]
    async fn test_failures_fall_through_to_next_provider() {
        let (breakers, mut registry) = registry();
        registry.register(ProviderKind::SemanticScholar, Arc::new(StaticBackend::failing()));
        registry.register(
            ProviderKind::Web,
            Arc::new(StaticBackend::new(&["https://web.example/1"])),
        );

        let (kind, _) = registry.search("aspirin", 10).await.unwrap();
        assert_eq!(kind, ProviderKind::Web);

        // A second failure opens the scholar circuit; next search skips it
        // without calling the backend.
        let (kind, _) = registry.search("aspirin again", 10).await.unwrap();
        assert_eq!(kind, ProviderKind::Web);
        assert_ne!(
            breakers.state("provider:semantic_scholar"),
            crate::scheduler::BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_all_providers_down_is_an_error() {
        let (_breakers, mut registry) = registry();
        registry.register(ProviderKind::Web, Arc::new(StaticBackend::failing()));
        assert!(registry.search("anything", 5).await.is_err());
    }
}
