//! Remote endpoints consumed by the core: embedding, reranking, NLI,
//! LLM generation, and page fetching.
//!
//! The traits are the seams; the reqwest implementations talk JSON to the
//! model server, LLM runtime, and fetcher service. Tests swap in the mock
//! clients defined at the bottom of this module.

mod clients;
mod types;

pub use clients::{
    EmbedClient, FetchClient, FetcherClient, GenerateClient, LlmRuntimeClient, ModelServerClient,
    NliClient, RerankClient,
};
pub use types::{FetchRequest, FetchResponse, NliLabel, NliPair, NliVerdict};

#[cfg(test)]
pub use mock::{
    MockEmbedClient, MockFetchClient, MockGenerateClient, MockNliClient, MockRerankClient,
};

#[cfg(test)]
pub mod mock {
    //! Deterministic in-process stand-ins for the remote endpoints.

    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::canonical::text_hash;
    use crate::error::{Error, Result};
    use serde_json::Value;

    /// Embedding mock: a fixed vector, or per-text overrides.
    pub struct MockEmbedClient {
        default: Vec<f32>,
        by_text: Mutex<HashMap<String, Vec<f32>>>,
        calls: AtomicUsize,
    }

    impl MockEmbedClient {
        pub fn returning(vector: Vec<f32>) -> Self {
            Self {
                default: vector,
                by_text: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_mapping(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
            self.by_text.get_mut().unwrap().insert(text.into(), vector);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbedClient for MockEmbedClient {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let map = self.by_text.lock().unwrap();
            Ok(texts
                .iter()
                .map(|t| map.get(t).cloned().unwrap_or_else(|| self.default.clone()))
                .collect())
        }
    }

    /// Rerank mock: scores by passage index, cycling if short.
    pub struct MockRerankClient {
        scores: Vec<f64>,
        calls: AtomicUsize,
    }

    impl MockRerankClient {
        pub fn with_scores(scores: Vec<f64>) -> Self {
            Self {
                scores,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RerankClient for MockRerankClient {
        async fn rerank(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..passages.len())
                .map(|i| {
                    if self.scores.is_empty() {
                        0.5
                    } else {
                        self.scores[i % self.scores.len()]
                    }
                })
                .collect())
        }
    }

    /// NLI mock: a fixed verdict, or a script consumed pair by pair.
    pub struct MockNliClient {
        default: NliVerdict,
        script: Mutex<Vec<NliVerdict>>,
        calls: AtomicUsize,
    }

    impl MockNliClient {
        pub fn always(label: NliLabel, probability: f64) -> Self {
            Self {
                default: NliVerdict::new(label, probability),
                script: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        /// Queue verdicts returned in order before falling back to the
        /// default.
        pub fn with_script(self, verdicts: Vec<NliVerdict>) -> Self {
            *self.script.lock().unwrap() = verdicts;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NliClient for MockNliClient {
        async fn nli(&self, pairs: &[NliPair]) -> Result<Vec<NliVerdict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            Ok(pairs
                .iter()
                .map(|_| {
                    if script.is_empty() {
                        self.default.clone()
                    } else {
                        script.remove(0)
                    }
                })
                .collect())
        }
    }

    /// LLM mock: scripted responses, optionally failing first.
    pub struct MockGenerateClient {
        responses: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MockGenerateClient {
        pub fn returning(text: impl Into<String>) -> Self {
            Self {
                responses: Mutex::new(vec![text.into()]),
                fail_first: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        /// Responses are consumed in order; the last one repeats.
        pub fn with_responses(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
                fail_first: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        /// Fail the first `n` calls with a transient error.
        pub fn failing_first(self, n: usize) -> Self {
            self.fail_first.store(n, Ordering::SeqCst);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerateClient for MockGenerateClient {
        async fn generate(&self, _prompt: &str, _schema: Option<&Value>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::transient("mock llm unavailable"));
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses.first().cloned().unwrap_or_default())
            }
        }
    }

    /// Fetch mock: canned bodies per URL, plus auth walls and work ids.
    pub struct MockFetchClient {
        bodies: Mutex<HashMap<String, String>>,
        auth_walls: Mutex<HashMap<String, bool>>,
        work_ids: Mutex<HashMap<String, String>>,
        calls: AtomicUsize,
    }

    impl MockFetchClient {
        pub fn new() -> Self {
            Self {
                bodies: Mutex::new(HashMap::new()),
                auth_walls: Mutex::new(HashMap::new()),
                work_ids: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_page(self, url: impl Into<String>, body: impl Into<String>) -> Self {
            self.bodies.lock().unwrap().insert(url.into(), body.into());
            self
        }

        /// The URL answers with an auth wall until cookies are supplied.
        pub fn with_auth_wall(self, url: impl Into<String>) -> Self {
            self.auth_walls.lock().unwrap().insert(url.into(), true);
            self
        }

        /// The URL resolves to a bibliographic record.
        pub fn with_work(self, url: impl Into<String>, canonical_id: impl Into<String>) -> Self {
            self.work_ids
                .lock()
                .unwrap()
                .insert(url.into(), canonical_id.into());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Default for MockFetchClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl FetchClient for MockFetchClient {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let walled = *self
                .auth_walls
                .lock()
                .unwrap()
                .get(&request.url)
                .unwrap_or(&false);
            if walled && request.session_cookies.is_none() {
                return Err(Error::auth_required(request.url.clone()));
            }
            let body = self
                .bodies
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .ok_or_else(|| Error::transient(format!("no mock page for {}", request.url)))?;
            Ok(FetchResponse {
                status: 200,
                headers: HashMap::new(),
                content_hash: text_hash(&body),
                final_url: request.url.clone(),
                body,
                auth_required: false,
                canonical_id: self.work_ids.lock().unwrap().get(&request.url).cloned(),
            })
        }
    }
}
