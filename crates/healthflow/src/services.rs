//! Wiring: builds the store, embedder, pipeline and services from a
//! [`Config`]. Shared by the HTTP server and the CLI.

use anyhow::{Context, Result};
use std::sync::Arc;

use healthflow_core::embedding::{Embedder, EmbeddingProvider};
use healthflow_core::error::CoreResult;
use healthflow_core::search::{semantic_search, SearchHit, SearchParams};
use healthflow_core::store::{ChatStore, Store, VectorIndex};

use crate::chat::{create_generator, AnswerGenerator, ChatService};
use crate::config::Config;
use crate::documents::{DocumentService, UploadLimits};
use crate::embedding::create_provider;
use crate::extract::{BuiltinExtractor, TextExtractor};
use crate::ingest::{IngestionPipeline, PipelineSettings};
use crate::records::RecordService;
use crate::sqlite_store::SqliteStore;
use crate::storage::{BlobStorage, FsBlobStorage};

pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<Embedder>,
    pub pipeline: Arc<IngestionPipeline>,
    pub documents: Arc<DocumentService>,
    pub records: Arc<RecordService>,
    pub chat: Arc<ChatService>,
}

impl Services {
    /// Open the database and build every service with the configured
    /// providers.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or the embedding provider
    /// is disabled or misconfigured.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let provider = create_provider(&config.embedding)?;
        let extractor = Arc::new(
            BuiltinExtractor::new(&config.extraction).context("Failed to build text extractor")?,
        );
        let generator = create_generator(&config.chat)?;
        Self::assemble(
            config,
            store,
            Arc::new(FsBlobStorage::new(&config.storage.root)),
            extractor,
            provider,
            generator,
        )
    }

    /// Build the services over explicit backends.
    pub fn assemble<S>(
        config: &Config,
        store: Arc<S>,
        blobs: Arc<dyn BlobStorage>,
        extractor: Arc<dyn TextExtractor>,
        provider: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Result<Self>
    where
        S: Store + VectorIndex + ChatStore + 'static,
    {
        let embedder = Arc::new(Embedder::new(provider, config.embedding.cache_capacity));
        let settings = PipelineSettings::from_config(config)?;
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            store.clone(),
            blobs.clone(),
            extractor,
            embedder.clone(),
            settings,
        ));
        let documents = Arc::new(DocumentService::new(
            store.clone(),
            blobs,
            pipeline.clone(),
            UploadLimits::from(&config.storage),
        ));
        let records = Arc::new(RecordService::new(store.clone(), &config.retrieval));
        let chat = Arc::new(ChatService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            embedder.clone(),
            generator,
            SearchParams {
                limit: config.chat.context_chunks,
                min_similarity: config.retrieval.min_similarity,
                max_top_k: config.retrieval.max_top_k,
            },
        ));
        Ok(Self {
            config: Arc::new(config.clone()),
            store: store.clone(),
            index: store,
            embedder,
            pipeline,
            documents,
            records,
            chat,
        })
    }

    /// Semantic search with `[retrieval]` defaults for omitted parameters.
    pub async fn search(
        &self,
        owner_id: &str,
        query: &str,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> CoreResult<Vec<SearchHit>> {
        let retrieval = &self.config.retrieval;
        let params = SearchParams {
            limit: limit.unwrap_or(retrieval.default_limit),
            min_similarity: threshold.unwrap_or(retrieval.min_similarity),
            max_top_k: retrieval.max_top_k,
        };
        semantic_search(
            self.store.as_ref(),
            self.index.as_ref(),
            &self.embedder,
            owner_id,
            query,
            params,
        )
        .await
    }
}
