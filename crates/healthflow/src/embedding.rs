//! Embedding provider implementations.
//!
//! - **[`OpenAIProvider`]**: `POST {url}/embeddings` on the OpenAI API (or
//!   any OpenAI-compatible gateway).
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//!
//! Each call makes exactly one HTTP request. Failures are classified so
//! the ingestion pipeline can decide whether to back off and retry:
//!
//! - HTTP 429 and 5xx → transient
//! - timeouts and connection errors → transient
//! - any other 4xx, or a malformed body → permanent
//!
//! Caching, token-limit checks and dimension checks live in
//! [`healthflow_core::embedding::Embedder`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use healthflow_core::embedding::EmbeddingProvider;
use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::ModelSpec;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Build the model contract from configuration.
pub fn model_spec(config: &EmbeddingConfig) -> Result<ModelSpec> {
    let name = config
        .model
        .clone()
        .ok_or_else(|| anyhow!("embedding.model required for {} provider", config.provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow!("embedding.dims required for {} provider", config.provider))?;
    Ok(ModelSpec {
        name,
        dims,
        max_input_tokens: config.max_input_tokens,
    })
}

/// Instantiate the configured provider.
///
/// # Errors
///
/// Fails when the provider is `"disabled"`, unknown, or missing settings
/// (model, dims, `OPENAI_API_KEY`).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "disabled" => bail!(
            "Embedding provider is disabled. Set [embedding] provider = \"openai\" or \"ollama\"."
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Map a transport error to the core taxonomy.
pub(crate) fn classify_transport(service: &str, e: reqwest::Error) -> CoreError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CoreError::transient(format!("{} request failed: {}", service, e))
    } else {
        CoreError::permanent(format!("{} request failed: {}", service, e))
    }
}

/// Map a non-success HTTP status to the core taxonomy.
pub(crate) fn classify_status(service: &str, status: reqwest::StatusCode, body: &str) -> CoreError {
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        CoreError::transient(message)
    } else {
        CoreError::permanent(message)
    }
}

pub(crate) async fn post_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> CoreResult<serde_json::Value> {
    let mut request = client.post(url).json(body);
    if let Some(key) = bearer {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(classify_status(service, status, &body_text));
    }

    response
        .json()
        .await
        .map_err(|e| CoreError::permanent(format!("{} returned invalid JSON: {}", service, e)))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIProvider {
    model: ModelSpec,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = model_spec(config)?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string());
        Ok(Self {
            model,
            url,
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model.name,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "OpenAI",
            &format!("{}/embeddings", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
        )
        .await?;
        parse_openai_response(&json).map_err(|e| CoreError::permanent(e.to_string()))
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_f32_vec(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with the embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: ModelSpec,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = model_spec(config)?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            model,
            url,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model.name,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "Ollama",
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
        )
        .await?;
        parse_ollama_response(&json).map_err(|e| CoreError::permanent(e.to_string()))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding
                .as_array()
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))?;
            to_f32_vec(values)
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("embedding component is not a number"))
        })
        .collect()
}
