//! Test doubles shared by the unit test modules.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

use healthflow_core::embedding::EmbeddingProvider;
use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{Document, DocumentType, ModelSpec, ProcessingStatus};

use crate::extract::{ExtractError, TextExtractor};
use crate::storage::BlobStorage;

/// Deterministic 4-dim provider named `test-embed`.
///
/// Texts containing `POISON` fail permanently; the first
/// `transient_failures` calls fail with a transient 503. With `gate` set,
/// each call signals the first `Notify` and then waits on the second.
pub struct ScriptedProvider {
    model: ModelSpec,
    calls: AtomicUsize,
    transient_failures: AtomicUsize,
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedProvider {
    pub fn new(transient_failures: usize) -> Self {
        Self {
            model: ModelSpec {
                name: "test-embed".into(),
                dims: 4,
                max_input_tokens: 8191,
            },
            calls: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(transient_failures),
            gate: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// The vector [`ScriptedProvider`] returns for `text`.
pub fn vector_for(text: &str) -> Vec<f32> {
    let len = text.chars().count() as f32;
    let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
    vec![1.0, len / 100.0, vowels / 10.0, 0.5]
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::transient("HTTP 503"));
        }
        if texts.iter().any(|t| t.contains("POISON")) {
            return Err(CoreError::permanent("HTTP 400: rejected input"));
        }
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

#[derive(Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobs {
    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(path)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobs {
    async fn put(
        &self,
        owner_id: &str,
        file_name: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> CoreResult<String> {
        let path = format!("{}/{}-{}", owner_id, Uuid::new_v4(), file_name);
        self.blobs.lock().unwrap().insert(path.clone(), bytes.to_vec());
        Ok(path)
    }

    async fn get(&self, path: &str) -> CoreResult<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::not_found("blob"))
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        self.blobs.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Accepts `text/plain` only.
pub struct Utf8Extractor;

#[async_trait]
impl TextExtractor for Utf8Extractor {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
        if mime_type != "text/plain" {
            return Err(ExtractError::UnsupportedContentType(mime_type.to_string()));
        }
        String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()))
    }
}

/// Stands in for an OCR endpoint: the first `outages` calls fail with a
/// transient 503, later calls decode the bytes as UTF-8.
pub struct FlakyOcr {
    outages: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyOcr {
    pub fn new(outages: usize) -> Self {
        Self {
            outages: AtomicUsize::new(outages),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextExtractor for FlakyOcr {
    async fn extract(&self, bytes: &[u8], _mime_type: &str) -> Result<String, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExtractError::Ocr {
                message: "OCR API error 503 Service Unavailable".into(),
                transient: true,
            });
        }
        String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()))
    }
}

pub fn pending_document(
    id: &str,
    owner_id: &str,
    storage_path: &str,
    mime_type: &str,
    size: usize,
) -> Document {
    let now = chrono::Utc::now().timestamp();
    Document {
        id: id.into(),
        owner_id: owner_id.into(),
        file_name: "note.txt".into(),
        storage_path: storage_path.into(),
        mime_type: mime_type.into(),
        file_size: size as i64,
        document_type: DocumentType::VisitSummary,
        processing_status: ProcessingStatus::Pending,
        processing_error: None,
        extracted_text: None,
        metadata: Default::default(),
        tags: vec![],
        document_date: None,
        uploaded_at: now,
        processed_at: None,
        created_at: now,
        updated_at: now,
    }
}
