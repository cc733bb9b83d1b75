//! Client traits for the remote endpoints the core consumes, plus their
//! reqwest implementations.
//!
//! Every call carries a deadline from config; HTTP status codes map onto
//! the scheduler's error classification (429 throttles, 5xx retries).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::rpc::types::{FetchRequest, FetchResponse, NliLabel, NliPair, NliVerdict};

/// Embedding endpoint: texts in, vectors out.
#[async_trait]
pub trait EmbedClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cross-encoder rerank endpoint.
#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>>;
}

/// NLI scoring endpoint.
#[async_trait]
pub trait NliClient: Send + Sync {
    async fn nli(&self, pairs: &[NliPair]) -> Result<Vec<NliVerdict>>;
}

/// Local LLM runtime for claim extraction and usefulness scoring.
#[async_trait]
pub trait GenerateClient: Send + Sync {
    async fn generate(&self, prompt: &str, schema: Option<&Value>) -> Result<String>;
}

/// Rate-limited URL fetcher.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::rpc("http", format!("failed to build client: {}", e)))
}

/// Map an HTTP failure onto the scheduler's error classification.
fn classify_response(endpoint: &str, status: reqwest::StatusCode, body: &str) -> Error {
    if status.as_u16() == 429 {
        Error::rate_limited(endpoint.to_string())
    } else if status.is_server_error() {
        Error::transient(format!("{} returned {}: {}", endpoint, status, body))
    } else {
        Error::rpc(endpoint, format!("{}: {}", status, body))
    }
}

fn classify_send_error(endpoint: &str, timeout_secs: u64, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(timeout_secs * 1000)
    } else {
        Error::transient(format!("{} request failed: {}", endpoint, e))
    }
}

async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
    http: &Client,
    endpoint: &str,
    url: &str,
    timeout_secs: u64,
    request: &Req,
) -> Result<Resp> {
    let response = http
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|e| classify_send_error(endpoint, timeout_secs, e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::transient(format!("{} body read failed: {}", endpoint, e)))?;

    if !status.is_success() {
        return Err(classify_response(endpoint, status, &body));
    }

    serde_json::from_str(&body)
        .map_err(|e| Error::rpc(endpoint, format!("bad response body: {}", e)))
}

/// Client for the model server exposing embed, rerank, and NLI routes.
pub struct ModelServerClient {
    http_embed: Client,
    http_rerank: Client,
    http_nli: Client,
    base_url: String,
    nli_timeout_secs: u64,
    rerank_timeout_secs: u64,
}

impl ModelServerClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        Ok(Self {
            // Embeddings share the NLI deadline; both run on the gpu slot.
            http_embed: build_http_client(config.nli_timeout_secs)?,
            http_rerank: build_http_client(config.rerank_timeout_secs)?,
            http_nli: build_http_client(config.nli_timeout_secs)?,
            base_url: config.model_base_url.trim_end_matches('/').to_string(),
            nli_timeout_secs: config.nli_timeout_secs,
            rerank_timeout_secs: config.rerank_timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct EmbedRequestBody<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponseBody {
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct RerankRequestBody<'a> {
    query: &'a str,
    passages: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponseBody {
    scores: Vec<f64>,
}

#[derive(Serialize)]
struct NliRequestBody<'a> {
    pairs: &'a [NliPair],
}

#[derive(Deserialize)]
struct NliResponseBody {
    results: Vec<NliResultBody>,
}

#[derive(Deserialize)]
struct NliResultBody {
    label: String,
    probability: f64,
}

#[async_trait]
impl EmbedClient for ModelServerClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let body: EmbedResponseBody = post_json(
            &self.http_embed,
            "embed",
            &url,
            self.nli_timeout_secs,
            &EmbedRequestBody { texts },
        )
        .await?;
        if body.vectors.len() != texts.len() {
            return Err(Error::rpc(
                "embed",
                format!("expected {} vectors, got {}", texts.len(), body.vectors.len()),
            ));
        }
        Ok(body.vectors)
    }
}

#[async_trait]
impl RerankClient for ModelServerClient {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let url = format!("{}/rerank", self.base_url);
        let body: RerankResponseBody = post_json(
            &self.http_rerank,
            "rerank",
            &url,
            self.rerank_timeout_secs,
            &RerankRequestBody { query, passages },
        )
        .await?;
        if body.scores.len() != passages.len() {
            return Err(Error::rpc(
                "rerank",
                format!("expected {} scores, got {}", passages.len(), body.scores.len()),
            ));
        }
        Ok(body.scores)
    }
}

#[async_trait]
impl NliClient for ModelServerClient {
    async fn nli(&self, pairs: &[NliPair]) -> Result<Vec<NliVerdict>> {
        let url = format!("{}/nli", self.base_url);
        let body: NliResponseBody = post_json(
            &self.http_nli,
            "nli",
            &url,
            self.nli_timeout_secs,
            &NliRequestBody { pairs },
        )
        .await?;
        if body.results.len() != pairs.len() {
            return Err(Error::rpc(
                "nli",
                format!("expected {} results, got {}", pairs.len(), body.results.len()),
            ));
        }
        body.results
            .into_iter()
            .map(|r| Ok(NliVerdict::new(NliLabel::parse(&r.label)?, r.probability)))
            .collect()
    }
}

/// Client for the local LLM runtime.
pub struct LlmRuntimeClient {
    http: Client,
    base_url: String,
    timeout_secs: u64,
}

impl LlmRuntimeClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config.llm_timeout_secs)?,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            timeout_secs: config.llm_timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct GenerateRequestBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a Value>,
}

#[derive(Deserialize)]
struct GenerateResponseBody {
    text: String,
}

#[async_trait]
impl GenerateClient for LlmRuntimeClient {
    async fn generate(&self, prompt: &str, schema: Option<&Value>) -> Result<String> {
        let url = format!("{}/generate", self.base_url);
        let body: GenerateResponseBody = post_json(
            &self.http,
            "llm_generate",
            &url,
            self.timeout_secs,
            &GenerateRequestBody { prompt, schema },
        )
        .await?;
        Ok(body.text)
    }
}

/// Client for the rate-limited fetcher service.
pub struct FetcherClient {
    http: Client,
    base_url: String,
    timeout_secs: u64,
}

impl FetcherClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config.fetch_timeout_secs)?,
            base_url: config.fetcher_base_url.trim_end_matches('/').to_string(),
            timeout_secs: config.fetch_timeout_secs,
        })
    }
}

#[async_trait]
impl FetchClient for FetcherClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let url = format!("{}/fetch", self.base_url);
        let body: FetchResponse =
            post_json(&self.http, "fetch", &url, self.timeout_secs, request).await?;
        if body.auth_required {
            return Err(Error::auth_required(request.url.clone()));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response() {
        let throttled = classify_response("serp", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(throttled, Error::RateLimited { .. }));
        assert!(throttled.retryable());

        let flaky = classify_response("fetch", reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(matches!(flaky, Error::Transient(_)));
        assert!(flaky.retryable());

        let broken = classify_response("nli", reqwest::StatusCode::BAD_REQUEST, "bad pairs");
        assert!(matches!(broken, Error::Rpc { .. }));
        assert!(!broken.retryable());
    }
}
