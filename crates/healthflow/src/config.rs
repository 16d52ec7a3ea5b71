//! Configuration parsing and validation.
//!
//! HealthFlow is configured via a TOML file (default:
//! `config/healthflow.toml`). The file is parsed once at start-up into a
//! [`Config`] value and passed by reference (`Arc<Config>` in the server).
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/healthflow.sqlite"
//!
//! [storage]
//! root = "./data/blobs"
//!
//! [chunking]
//! max_chunk_chars = 2000
//! overlap_chars = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [[auth.users]]
//! username = "alice"
//! subject = "user-alice"
//! password_salt = "…"
//! password_hash = "…"
//! ```
//!
//! Every section except `[db]` has defaults. [`load_config`] rejects
//! out-of-range values before anything else runs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_allowed_mime_types() -> Vec<String> {
    [
        "application/pdf",
        "image/jpeg",
        "image/png",
        "image/jpg",
        "image/heic",
        "audio/mpeg",
        "audio/wav",
        "audio/m4a",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "text/plain",
        "text/markdown",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    2000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ollama"` or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Provider base URL override (OpenAI-compatible gateway, Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            max_input_tokens: default_max_input_tokens(),
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_input_tokens() -> usize {
    8191
}
fn default_batch_size() -> usize {
    16
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_top_k: default_max_top_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_max_top_k() -> usize {
    50
}
fn default_min_similarity() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractionConfig {
    /// HTTP endpoint that accepts raw image bytes and returns `{"text": …}`.
    #[serde(default)]
    pub ocr_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub ocr_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// `"openai"` or `"disabled"` (extractive answers).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_chat_model(),
            url: None,
            context_chunks: default_context_chunks(),
            max_tokens: default_chat_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_context_chunks() -> usize {
    5
}
fn default_chat_max_tokens() -> u32 {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Environment variable holding the token signing key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    #[serde(default = "default_access_ttl_secs")]
    pub access_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: i64,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_key_env: default_signing_key_env(),
            access_ttl_secs: default_access_ttl_secs(),
            refresh_ttl_secs: default_refresh_ttl_secs(),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    /// Opaque owner key stored on every row this user owns.
    pub subject: String,
    /// Hex PBKDF2 salt, as printed by `healthflow hash-password`.
    pub password_salt: String,
    /// Hex PBKDF2-HMAC-SHA256 digest of the password under the salt.
    pub password_hash: String,
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

fn default_pbkdf2_iterations() -> u32 {
    crate::identity::PBKDF2_ITERATIONS
}

fn default_signing_key_env() -> String {
    "HEALTHFLOW_SIGNING_KEY".to_string()
}
fn default_access_ttl_secs() -> i64 {
    15 * 60
}
fn default_refresh_ttl_secs() -> i64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_chunk_chars == 0 {
        bail!("chunking.max_chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chunk_chars {
        bail!("chunking.overlap_chars must be smaller than chunking.max_chunk_chars");
    }

    // Storage
    if config.storage.max_upload_bytes == 0 {
        bail!("storage.max_upload_bytes must be > 0");
    }
    if config.storage.allowed_mime_types.is_empty() {
        bail!("storage.allowed_mime_types must not be empty");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }
    if config.embedding.max_input_tokens == 0 {
        bail!("embedding.max_input_tokens must be > 0");
    }

    // Retrieval
    if config.retrieval.max_top_k == 0 {
        bail!("retrieval.max_top_k must be >= 1");
    }
    if config.retrieval.default_limit == 0
        || config.retrieval.default_limit > config.retrieval.max_top_k
    {
        bail!("retrieval.default_limit must be in [1, retrieval.max_top_k]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    // Chat
    match config.chat.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown chat provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.chat.context_chunks == 0 {
        bail!("chat.context_chunks must be > 0");
    }

    // Auth
    if config.auth.access_ttl_secs <= 0 || config.auth.refresh_ttl_secs <= 0 {
        bail!("auth token lifetimes must be > 0");
    }
    for user in &config.auth.users {
        let salt_ok = hex::decode(&user.password_salt)
            .is_ok_and(|salt| salt.len() >= crate::identity::SALT_LENGTH);
        if !salt_ok {
            bail!(
                "auth.users '{}': password_salt must be at least {} hex-encoded bytes",
                user.username,
                crate::identity::SALT_LENGTH
            );
        }
        let hash_ok = hex::decode(&user.password_hash)
            .is_ok_and(|hash| hash.len() == crate::identity::HASH_LENGTH);
        if !hash_ok {
            bail!(
                "auth.users '{}': password_hash must be a {}-byte hex digest",
                user.username,
                crate::identity::HASH_LENGTH
            );
        }
        if user.pbkdf2_iterations == 0 {
            bail!("auth.users '{}': pbkdf2_iterations must be > 0", user.username);
        }
        if user.subject.trim().is_empty() {
            bail!("auth.users '{}': subject must not be empty", user.username);
        }
    }

    Ok(())
}
