//! Document ingestion pipeline.
//!
//! Drives a document through
//! `pending → processing → {completed | partially_completed | failed}`:
//!
//! ```text
//! blob ──► extract ──► chunk ──► embed (batched, concurrent) ──► index
//!                                  │
//!                                  └─ failed chunks ──► retry queue
//! ```
//!
//! # Retries
//!
//! Each embedding batch retries transient provider errors (429, 5xx,
//! network, timeout) with exponential backoff
//! `backoff_base_ms × 2^attempt`, capped at 32×, up to `max_retries`
//! times. A batch that still fails is split into single-chunk calls so one
//! bad chunk does not take its neighbours down. Chunks that fail on their
//! own are queued in the retry queue and the document settles as
//! `partially_completed`; [`IngestionPipeline::retry_pending`] drains the
//! queue later.
//!
//! # Cancellation
//!
//! Runs register in a [`CancelRegistry`] keyed by document id. Deleting a
//! document signals the registry; the run drops its pending embedding
//! futures at the next await point and returns [`CoreError::Cancelled`].
//! A store `NotFound` seen mid-run means the document vanished and is
//! reported the same way.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use healthflow_core::chunk::{chunk_text, ChunkParams};
use healthflow_core::embedding::Embedder;
use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{Chunk, Document, ProcessingStatus, RetryEntry};
use healthflow_core::store::{Store, VectorIndex};

use crate::config::Config;
use crate::extract::{ExtractError, TextExtractor};
use crate::storage::BlobStorage;

/// Largest backoff exponent; delays stop growing at `32 × base`.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Tuning knobs for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunking: ChunkParams,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let chunking = ChunkParams::new(
            config.chunking.max_chunk_chars,
            config.chunking.overlap_chars,
        )?;
        Ok(Self {
            chunking,
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            max_retries: config.embedding.max_retries,
            backoff_base_ms: config.embedding.backoff_base_ms,
        })
    }
}

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub status: ProcessingStatus,
    pub chunks: usize,
    pub embedded: usize,
    pub failed: usize,
    /// `true` when the document was already complete and nothing ran.
    pub skipped: bool,
}

// ============ Cancellation ============

/// In-flight runs keyed by document id.
#[derive(Default)]
pub struct CancelRegistry {
    next_id: AtomicU64,
    runs: Mutex<HashMap<String, (u64, watch::Sender<bool>)>>,
}

/// Registration of one run. Dropping it unregisters the run.
pub struct CancelHandle<'a> {
    registry: &'a CancelRegistry,
    document_id: String,
    registration: u64,
    receiver: watch::Receiver<bool>,
}

impl CancelRegistry {
    pub fn register(&self, document_id: &str) -> CancelHandle<'_> {
        let registration = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(false);
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), (registration, sender));
        CancelHandle {
            registry: self,
            document_id: document_id.to_string(),
            registration,
            receiver,
        }
    }

    /// Signal the run for `document_id`. Returns `false` when none is active.
    pub fn cancel(&self, document_id: &str) -> bool {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match runs.get(document_id) {
            Some((_, sender)) => sender.send(true).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self, document_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(document_id)
    }
}

impl CancelHandle<'_> {
    /// Resolves once the run is cancelled; never resolves otherwise.
    async fn cancelled(&mut self) {
        let signalled = self.receiver.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if signalled.is_err() {
            // Sender gone: the registry entry was replaced, never cancel.
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for CancelHandle<'_> {
    fn drop(&mut self) {
        let mut runs = self
            .registry
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A newer run of the same document may have registered since.
        if runs
            .get(&self.document_id)
            .is_some_and(|(registration, _)| *registration == self.registration)
        {
            runs.remove(&self.document_id);
        }
    }
}

fn cancelled_error() -> CoreError {
    CoreError::Cancelled("document was deleted during ingestion".to_string())
}

/// The document disappeared under us: treat it as a cancellation.
fn vanished(e: CoreError) -> CoreError {
    match e {
        CoreError::NotFound(_) => cancelled_error(),
        other => other,
    }
}

/// Delay before retry number `attempt` (0-based).
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(MAX_BACKOFF_EXPONENT)))
}

// ============ Pipeline ============

struct ChunkFailure {
    attempts: u32,
    error: CoreError,
}

type BatchResult = Vec<(Chunk, Result<Vec<f32>, ChunkFailure>)>;

#[derive(Default)]
struct EmbedReport {
    embedded: usize,
    failed: usize,
    last_error: Option<String>,
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    blobs: Arc<dyn BlobStorage>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<Embedder>,
    settings: PipelineSettings,
    cancellations: CancelRegistry,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        blobs: Arc<dyn BlobStorage>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<Embedder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            index,
            blobs,
            extractor,
            embedder,
            settings,
            cancellations: CancelRegistry::default(),
        }
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn cancellations(&self) -> &CancelRegistry {
        &self.cancellations
    }

    /// Signal an in-flight run of `document_id` to stop.
    pub fn cancel(&self, document_id: &str) -> bool {
        let signalled = self.cancellations.cancel(document_id);
        if signalled {
            tracing::info!(document_id, "ingestion cancellation requested");
        }
        signalled
    }

    /// Run ingestion in a background task, logging the outcome.
    pub fn spawn(
        self: &Arc<Self>,
        owner_id: String,
        document_id: String,
        force: bool,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            match pipeline.run(&owner_id, &document_id, force).await {
                Ok(outcome) => tracing::debug!(
                    document_id = %outcome.document_id,
                    status = %outcome.status,
                    "background ingestion finished"
                ),
                Err(CoreError::Cancelled(_)) => {}
                Err(e) => tracing::error!(document_id = %document_id, error = %e, "background ingestion failed"),
            }
        })
    }

    /// Ingest one document.
    ///
    /// - `completed` without `force`: no-op, reported as skipped.
    /// - `partially_completed` without `force`: retries the queued chunks.
    /// - `processing`: rejected with `Validation`.
    /// - otherwise (or with `force`): full extract → chunk → embed run that
    ///   replaces any previous chunks, embeddings and retry entries.
    pub async fn run(
        &self,
        owner_id: &str,
        document_id: &str,
        force: bool,
    ) -> CoreResult<IngestOutcome> {
        let doc = self
            .store
            .get_document(owner_id, document_id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))?;

        match (doc.processing_status, force) {
            (ProcessingStatus::Processing, _) => Err(CoreError::Validation(
                "document is already being processed".to_string(),
            )),
            (ProcessingStatus::Completed, false) => {
                tracing::info!(document_id, "document already completed; skipping");
                self.skipped(owner_id, &doc).await
            }
            (ProcessingStatus::PartiallyCompleted, false) => {
                self.retry_pending(owner_id, document_id).await
            }
            _ => self.full_run(owner_id, document_id).await,
        }
    }

    /// Re-embed only the chunks queued for the active model.
    ///
    /// The document must be `partially_completed` (a `completed` document is
    /// a skipped no-op). It settles as `completed` once the queue is empty.
    pub async fn retry_pending(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> CoreResult<IngestOutcome> {
        let doc = self
            .store
            .get_document(owner_id, document_id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))?;

        match doc.processing_status {
            ProcessingStatus::PartiallyCompleted => {}
            ProcessingStatus::Completed => return self.skipped(owner_id, &doc).await,
            ProcessingStatus::Processing => {
                return Err(CoreError::Validation(
                    "document is already being processed".to_string(),
                ))
            }
            other => {
                return Err(CoreError::Validation(format!(
                    "document is {}; only partially_completed documents have queued chunks",
                    other
                )))
            }
        }

        self.store.begin_processing(owner_id, document_id).await?;
        let mut cancel = self.cancellations.register(document_id);
        let result = self.retry_queued(owner_id, document_id, &mut cancel).await;
        self.settle_on_error(owner_id, document_id, result, ProcessingStatus::PartiallyCompleted)
            .await
    }

    async fn skipped(&self, owner_id: &str, doc: &Document) -> CoreResult<IngestOutcome> {
        let chunks = self.store.list_chunks(owner_id, &doc.id).await?.len();
        let embedded = self
            .index
            .count_embedded(owner_id, &doc.id, &self.embedder.model().name)
            .await?;
        Ok(IngestOutcome {
            document_id: doc.id.clone(),
            status: doc.processing_status,
            chunks,
            embedded,
            failed: 0,
            skipped: true,
        })
    }

    async fn full_run(&self, owner_id: &str, document_id: &str) -> CoreResult<IngestOutcome> {
        let doc = self.store.begin_processing(owner_id, document_id).await?;
        tracing::info!(document_id, file_name = %doc.file_name, "ingestion started");
        let mut cancel = self.cancellations.register(document_id);
        let result = self.process(owner_id, &doc, &mut cancel).await;
        self.settle_on_error(owner_id, document_id, result, ProcessingStatus::Failed)
            .await
    }

    /// Leave no document stuck in `processing` after an unexpected error.
    async fn settle_on_error(
        &self,
        owner_id: &str,
        document_id: &str,
        result: CoreResult<IngestOutcome>,
        fallback: ProcessingStatus,
    ) -> CoreResult<IngestOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(CoreError::Cancelled(reason)) => {
                tracing::info!(document_id, "ingestion cancelled");
                Err(CoreError::Cancelled(reason))
            }
            Err(e) => {
                tracing::error!(document_id, error = %e, "ingestion aborted");
                match self
                    .store
                    .finish_processing(owner_id, document_id, fallback, Some(&e.to_string()))
                    .await
                {
                    Ok(()) | Err(CoreError::NotFound(_)) => {}
                    Err(settle_err) => {
                        tracing::warn!(document_id, error = %settle_err, "could not record failure")
                    }
                }
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        owner_id: &str,
        doc: &Document,
        cancel: &mut CancelHandle<'_>,
    ) -> CoreResult<IngestOutcome> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_error()),
            fetched = self.blobs.get(&doc.storage_path) => fetched,
        };
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(CoreError::NotFound(_)) => {
                return self.fail(owner_id, &doc.id, "stored file is missing").await
            }
            Err(e) => return Err(e),
        };

        let extracted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_error()),
            extracted = self.extract_with_backoff(&doc.id, &bytes, &doc.mime_type) => extracted,
        };
        let text = match extracted {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => return self.fail(owner_id, &doc.id, "no text could be extracted").await,
            Err(e) => return self.fail(owner_id, &doc.id, &e.to_string()).await,
        };
        self.store
            .set_extracted_text(owner_id, &doc.id, &text)
            .await
            .map_err(vanished)?;

        let now = chrono::Utc::now().timestamp();
        let chunks: Vec<Chunk> = chunk_text(&text, &self.settings.chunking)
            .into_iter()
            .map(|piece| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                owner_id: owner_id.to_string(),
                chunk_index: piece.index as i64,
                text: piece.text,
                char_count: piece.char_count as i64,
                hash: piece.hash,
                created_at: now,
            })
            .collect();
        self.store
            .replace_chunks(owner_id, &doc.id, &chunks)
            .await
            .map_err(vanished)?;
        tracing::info!(
            document_id = %doc.id,
            chars = text.chars().count(),
            chunks = chunks.len(),
            "document chunked"
        );

        let report = self
            .embed_and_index(owner_id, &doc.id, chunks.clone(), false, cancel)
            .await?;

        let (status, error) = if report.failed == 0 {
            (ProcessingStatus::Completed, None)
        } else {
            (
                ProcessingStatus::PartiallyCompleted,
                Some(failure_summary(report.failed, chunks.len(), &report)),
            )
        };
        self.store
            .finish_processing(owner_id, &doc.id, status, error.as_deref())
            .await
            .map_err(vanished)?;
        tracing::info!(
            document_id = %doc.id,
            status = %status,
            embedded = report.embedded,
            failed = report.failed,
            "ingestion finished"
        );

        Ok(IngestOutcome {
            document_id: doc.id.clone(),
            status,
            chunks: chunks.len(),
            embedded: report.embedded,
            failed: report.failed,
            skipped: false,
        })
    }

    async fn retry_queued(
        &self,
        owner_id: &str,
        document_id: &str,
        cancel: &mut CancelHandle<'_>,
    ) -> CoreResult<IngestOutcome> {
        let model = self.embedder.model().name.clone();
        let chunks = self
            .store
            .list_chunks(owner_id, document_id)
            .await
            .map_err(vanished)?;
        let queued: Vec<String> = self
            .store
            .list_retries(owner_id, document_id)
            .await
            .map_err(vanished)?
            .into_iter()
            .filter(|entry| entry.model == model)
            .map(|entry| entry.chunk_id)
            .collect();
        let targets: Vec<Chunk> = chunks
            .iter()
            .filter(|chunk| queued.contains(&chunk.id))
            .cloned()
            .collect();
        tracing::info!(document_id, queued = targets.len(), "retrying queued chunks");

        let report = self
            .embed_and_index(owner_id, document_id, targets, true, cancel)
            .await?;

        let remaining = self
            .store
            .list_retries(owner_id, document_id)
            .await
            .map_err(vanished)?
            .into_iter()
            .filter(|entry| entry.model == model)
            .count();
        let (status, error) = if remaining == 0 {
            (ProcessingStatus::Completed, None)
        } else {
            (
                ProcessingStatus::PartiallyCompleted,
                Some(failure_summary(remaining, chunks.len(), &report)),
            )
        };
        self.store
            .finish_processing(owner_id, document_id, status, error.as_deref())
            .await
            .map_err(vanished)?;
        let embedded = self
            .index
            .count_embedded(owner_id, document_id, &model)
            .await
            .map_err(vanished)?;
        tracing::info!(document_id, status = %status, remaining, "retry finished");

        Ok(IngestOutcome {
            document_id: document_id.to_string(),
            status,
            chunks: chunks.len(),
            embedded,
            failed: remaining,
            skipped: false,
        })
    }

    /// Embed `chunks` in concurrent batches and store the vectors.
    ///
    /// Failed chunks go to the retry queue; with `clear_queue` the queue
    /// entries of chunks that succeed are removed.
    async fn embed_and_index(
        &self,
        owner_id: &str,
        document_id: &str,
        chunks: Vec<Chunk>,
        clear_queue: bool,
        cancel: &mut CancelHandle<'_>,
    ) -> CoreResult<EmbedReport> {
        let model = self.embedder.model().clone();
        let batches: Vec<Vec<Chunk>> = chunks
            .chunks(self.settings.batch_size)
            .map(|batch| batch.to_vec())
            .collect();

        let mut results = stream::iter(batches)
            .map(|batch| self.embed_batch(batch))
            .buffer_unordered(self.settings.concurrency);

        let mut report = EmbedReport::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled_error()),
                next = results.next() => next,
            };
            let Some(batch) = next else { break };

            for (chunk, outcome) in batch {
                match outcome {
                    Ok(vector) => {
                        self.index
                            .upsert(owner_id, &chunk.id, &vector, &model)
                            .await
                            .map_err(vanished)?;
                        if clear_queue {
                            self.store
                                .clear_retry(owner_id, &chunk.id, &model.name)
                                .await
                                .map_err(vanished)?;
                        }
                        report.embedded += 1;
                    }
                    Err(failure) => {
                        tracing::warn!(
                            document_id,
                            chunk_index = chunk.chunk_index,
                            attempts = failure.attempts,
                            error = %failure.error,
                            "chunk queued for retry"
                        );
                        let entry = RetryEntry {
                            chunk_id: chunk.id.clone(),
                            document_id: document_id.to_string(),
                            owner_id: owner_id.to_string(),
                            model: model.name.clone(),
                            attempts: i64::from(failure.attempts),
                            last_error: failure.error.to_string(),
                            updated_at: chrono::Utc::now().timestamp(),
                        };
                        self.store.record_retry(&entry).await.map_err(vanished)?;
                        report.failed += 1;
                        report.last_error = Some(failure.error.to_string());
                    }
                }
            }
        }
        Ok(report)
    }

    /// Embed one batch, falling back to one call per chunk when the batch
    /// as a whole fails.
    async fn embed_batch(&self, batch: Vec<Chunk>) -> BatchResult {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match self.embed_with_backoff(&texts).await {
            Ok(vectors) => batch.into_iter().zip(vectors.into_iter().map(Ok)).collect(),
            Err(failure) if batch.len() == 1 => batch
                .into_iter()
                .zip(std::iter::once(Err(failure)))
                .collect(),
            Err(failure) => {
                tracing::debug!(
                    size = batch.len(),
                    error = %failure.error,
                    "batch failed; embedding chunks individually"
                );
                let mut out = Vec::with_capacity(batch.len());
                for chunk in batch {
                    let single = [chunk.text.clone()];
                    let outcome = self
                        .embed_with_backoff(&single)
                        .await
                        .and_then(|mut vectors| {
                            vectors.pop().ok_or_else(|| ChunkFailure {
                                attempts: 1,
                                error: CoreError::permanent("empty embedding response"),
                            })
                        });
                    out.push((chunk, outcome));
                }
                out
            }
        }
    }

    async fn embed_with_backoff(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ChunkFailure> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.embedder.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt <= self.settings.max_retries => {
                    let delay = backoff_delay(self.settings.backoff_base_ms, attempt - 1);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient embedding failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(ChunkFailure {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }

    async fn extract_with_backoff(
        &self,
        document_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, ExtractError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.extractor.extract(bytes, mime_type).await {
                Err(e) if e.is_transient() && attempt <= self.settings.max_retries => {
                    let delay = backoff_delay(self.settings.backoff_base_ms, attempt - 1);
                    tracing::warn!(
                        document_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient extraction failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn fail(
        &self,
        owner_id: &str,
        document_id: &str,
        reason: &str,
    ) -> CoreResult<IngestOutcome> {
        tracing::warn!(document_id, reason, "extraction failed");
        self.store
            .finish_processing(owner_id, document_id, ProcessingStatus::Failed, Some(reason))
            .await
            .map_err(vanished)?;
        Ok(IngestOutcome {
            document_id: document_id.to_string(),
            status: ProcessingStatus::Failed,
            chunks: 0,
            embedded: 0,
            failed: 0,
            skipped: false,
        })
    }
}

fn failure_summary(failed: usize, total: usize, report: &EmbedReport) -> String {
    match &report.last_error {
        Some(last) => format!(
            "{} of {} chunks failed to embed; last error: {}",
            failed, total, last
        ),
        None => format!("{} of {} chunks still queued for embedding", failed, total),
    }
}
