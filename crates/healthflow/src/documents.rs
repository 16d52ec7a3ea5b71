//! Document service: upload, listing, annotation, deletion and
//! reprocessing, all scoped to the calling owner.
//!
//! Uploads are validated against `[storage]` limits before any blob or
//! database work. A successful upload leaves a `pending` document; callers
//! decide whether to ingest it right away (the HTTP handler spawns a
//! background run, the CLI runs it inline on request).

use std::sync::Arc;
use uuid::Uuid;

use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{Chunk, Document, DocumentType, ProcessingStatus};
use healthflow_core::store::{Annotations, Store};

use crate::config::StorageConfig;
use crate::ingest::{IngestOutcome, IngestionPipeline};
use crate::storage::BlobStorage;

/// A file as received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub document_type: DocumentType,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl From<&StorageConfig> for UploadLimits {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            allowed_mime_types: config
                .allowed_mime_types
                .iter()
                .map(|m| normalize_mime(m))
                .collect(),
        }
    }
}

impl UploadLimits {
    pub fn is_oversized(&self, size: usize) -> bool {
        size as u64 > self.max_upload_bytes
    }

    fn check(&self, size: usize, mime: &str) -> CoreResult<()> {
        if size == 0 {
            return Err(CoreError::Validation("file is empty".to_string()));
        }
        if self.is_oversized(size) {
            return Err(CoreError::Validation(format!(
                "file is {} bytes; the limit is {} bytes",
                size, self.max_upload_bytes
            )));
        }
        if !self.allowed_mime_types.iter().any(|m| m == mime) {
            return Err(CoreError::Validation(format!(
                "content type '{}' is not accepted",
                mime
            )));
        }
        Ok(())
    }
}

/// Lowercased MIME type without parameters (`text/plain; charset=utf-8`
/// → `text/plain`).
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub struct DocumentService {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStorage>,
    pipeline: Arc<IngestionPipeline>,
    limits: UploadLimits,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStorage>,
        pipeline: Arc<IngestionPipeline>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            store,
            blobs,
            pipeline,
            limits,
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    /// Validate, store the blob and create a `pending` document.
    pub async fn upload(&self, owner_id: &str, upload: Upload) -> CoreResult<Document> {
        let mime = normalize_mime(&upload.mime_type);
        self.limits.check(upload.bytes.len(), &mime)?;
        let file_name = upload.file_name.trim();
        if file_name.is_empty() {
            return Err(CoreError::Validation("file name is required".to_string()));
        }

        let storage_path = self
            .blobs
            .put(owner_id, file_name, &upload.bytes, &mime)
            .await?;

        let now = chrono::Utc::now().timestamp();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
            storage_path,
            mime_type: mime,
            file_size: upload.bytes.len() as i64,
            document_type: upload.document_type,
            processing_status: ProcessingStatus::Pending,
            processing_error: None,
            extracted_text: None,
            metadata: serde_json::Map::new(),
            tags: Vec::new(),
            document_date: None,
            uploaded_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_document(&doc).await {
            if let Err(cleanup) = self.blobs.delete(&doc.storage_path).await {
                tracing::warn!(path = %doc.storage_path, error = %cleanup, "orphaned blob after failed insert");
            }
            return Err(e);
        }
        tracing::info!(
            document_id = %doc.id,
            document_type = %doc.document_type,
            size = doc.file_size,
            "document uploaded"
        );
        Ok(doc)
    }

    pub async fn get(&self, owner_id: &str, id: &str) -> CoreResult<Document> {
        self.store
            .get_document(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))
    }

    pub async fn list(
        &self,
        owner_id: &str,
        document_type: Option<DocumentType>,
    ) -> CoreResult<Vec<Document>> {
        self.store.list_documents(owner_id, document_type).await
    }

    pub async fn update_annotations(
        &self,
        owner_id: &str,
        id: &str,
        annotations: &Annotations,
    ) -> CoreResult<Document> {
        if let Some(tags) = &annotations.tags {
            if tags.iter().any(|t| t.trim().is_empty()) {
                return Err(CoreError::Validation("tags must not be blank".to_string()));
            }
        }
        self.store.update_annotations(owner_id, id, annotations).await
    }

    /// Cancel any in-flight run, delete the rows, then the blob.
    ///
    /// A blob that cannot be removed is logged and left behind; the
    /// document is gone either way.
    pub async fn delete(&self, owner_id: &str, id: &str) -> CoreResult<()> {
        let doc = self.get(owner_id, id).await?;
        self.pipeline.cancel(id);
        if !self.store.delete_document(owner_id, id).await? {
            return Err(CoreError::not_found("document"));
        }
        if let Err(e) = self.blobs.delete(&doc.storage_path).await {
            tracing::warn!(document_id = id, path = %doc.storage_path, error = %e, "blob delete failed");
        }
        tracing::info!(document_id = id, "document deleted");
        Ok(())
    }

    pub async fn chunks(&self, owner_id: &str, id: &str) -> CoreResult<Vec<Chunk>> {
        self.get(owner_id, id).await?;
        self.store.list_chunks(owner_id, id).await
    }

    pub async fn reprocess(
        &self,
        owner_id: &str,
        id: &str,
        force: bool,
    ) -> CoreResult<IngestOutcome> {
        self.pipeline.run(owner_id, id, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthflow_core::chunk::ChunkParams;
    use healthflow_core::embedding::Embedder;
    use healthflow_core::store::memory::InMemoryStore;

    use crate::ingest::PipelineSettings;
    use crate::testing::{MemoryBlobs, ScriptedProvider, Utf8Extractor};

    struct Fixture {
        store: Arc<InMemoryStore>,
        blobs: Arc<MemoryBlobs>,
        service: DocumentService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let blobs = Arc::new(MemoryBlobs::default());
        let embedder = Arc::new(Embedder::new(Arc::new(ScriptedProvider::new(0)), 100));
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            store.clone(),
            blobs.clone(),
            Arc::new(Utf8Extractor),
            embedder,
            PipelineSettings {
                chunking: ChunkParams::new(200, 20).unwrap(),
                batch_size: 4,
                concurrency: 2,
                max_retries: 1,
                backoff_base_ms: 1,
            },
        ));
        let limits = UploadLimits {
            max_upload_bytes: 64,
            allowed_mime_types: vec!["text/plain".into(), "application/pdf".into()],
        };
        let service = DocumentService::new(store.clone(), blobs.clone(), pipeline, limits);
        Fixture {
            store,
            blobs,
            service,
        }
    }

    fn text_upload(body: &str) -> Upload {
        Upload {
            file_name: "visit.txt".into(),
            mime_type: "text/plain; charset=utf-8".into(),
            document_type: DocumentType::VisitSummary,
            bytes: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn upload_creates_pending_document() {
        let f = fixture();
        let doc = f.service.upload("alice", text_upload("BP 120/80")).await.unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Pending);
        assert_eq!(doc.mime_type, "text/plain");
        assert_eq!(doc.file_size, 9);
        assert!(f.blobs.contains(&doc.storage_path));
        assert_eq!(f.service.get("alice", &doc.id).await.unwrap().id, doc.id);
    }

    #[tokio::test]
    async fn upload_rejects_oversized_and_unlisted_types() {
        let f = fixture();
        let err = f
            .service
            .upload("alice", text_upload(&"x".repeat(65)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let mut audio = text_upload("ID3");
        audio.mime_type = "audio/mpeg".into();
        assert!(matches!(
            f.service.upload("alice", audio).await,
            Err(CoreError::Validation(_))
        ));

        assert!(matches!(
            f.service.upload("alice", text_upload("")).await,
            Err(CoreError::Validation(_))
        ));
        assert!(f.service.list("alice", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_owner_sees_not_found() {
        let f = fixture();
        let doc = f.service.upload("alice", text_upload("A1c 6.1%")).await.unwrap();
        assert!(matches!(
            f.service.get("bob", &doc.id).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            f.service.delete("bob", &doc.id).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            f.service.chunks("bob", &doc.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reprocess_then_list_chunks() {
        let f = fixture();
        let doc = f.service.upload("alice", text_upload("LDL 130 mg/dL")).await.unwrap();
        let outcome = f.service.reprocess("alice", &doc.id, false).await.unwrap();
        assert_eq!(outcome.status, ProcessingStatus::Completed);
        let chunks = f.service.chunks("alice", &doc.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "LDL 130 mg/dL");
    }

    #[tokio::test]
    async fn annotations_apply_in_any_status() {
        let f = fixture();
        let doc = f.service.upload("alice", text_upload("CBC normal")).await.unwrap();
        f.store.begin_processing("alice", &doc.id).await.unwrap();

        let updated = f
            .service
            .update_annotations(
                "alice",
                &doc.id,
                &Annotations {
                    tags: Some(vec!["labs".into()]),
                    ..Annotations::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.tags, vec!["labs".to_string()]);
        assert_eq!(updated.processing_status, ProcessingStatus::Processing);

        let blank = Annotations {
            tags: Some(vec!["  ".into()]),
            ..Annotations::default()
        };
        assert!(f
            .service
            .update_annotations("alice", &doc.id, &blank)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_removes_rows_and_blob() {
        let f = fixture();
        let doc = f.service.upload("alice", text_upload("TSH 2.1")).await.unwrap();
        f.service.reprocess("alice", &doc.id, false).await.unwrap();

        f.service.delete("alice", &doc.id).await.unwrap();
        assert!(!f.blobs.contains(&doc.storage_path));
        assert!(f.store.get_document("alice", &doc.id).await.unwrap().is_none());
        assert!(matches!(
            f.service.delete("alice", &doc.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn mime_normalization() {
        assert_eq!(normalize_mime("Text/Plain; charset=UTF-8"), "text/plain");
        assert_eq!(normalize_mime("application/pdf"), "application/pdf");
    }
}
