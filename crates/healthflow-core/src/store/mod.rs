//! Storage abstraction for HealthFlow.
//!
//! Three traits split the persistence surface by concern:
//!
//! | Trait | Owns |
//! |-------|------|
//! | [`Store`] | documents, chunks, the retry queue, medical entities, timeline events |
//! | [`VectorIndex`] | embeddings and owner-scoped similarity queries |
//! | [`ChatStore`] | chat sessions and messages |
//!
//! Every operation takes the caller's `owner_id` and treats rows owned by
//! someone else exactly like missing rows. Implementations must be
//! `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    ChatMessage, ChatSession, Chunk, Document, DocumentType, EntityType, EventType,
    MedicalEntity, ModelSpec, ProcessingStatus, RetryEntry, ScoredChunk, TimelineEvent,
};

/// Tag/metadata edit applied by [`Store::update_annotations`].
///
/// `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub document_date: Option<chrono::NaiveDate>,
}

/// Field edits applied by [`Store::update_entity`]. `None` leaves the
/// field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EntityUpdate {
    pub entity_type: Option<EntityType>,
    pub entity_data: Option<serde_json::Value>,
    pub entity_date: Option<chrono::NaiveDate>,
    pub is_verified: Option<bool>,
}

impl EntityUpdate {
    pub fn apply(&self, entity: &mut MedicalEntity) {
        if let Some(entity_type) = self.entity_type {
            entity.entity_type = entity_type;
        }
        if let Some(data) = &self.entity_data {
            entity.entity_data = data.clone();
        }
        if let Some(date) = self.entity_date {
            entity.entity_date = Some(date);
        }
        if let Some(verified) = self.is_verified {
            entity.is_verified = verified;
        }
    }
}

/// Field edits applied by [`Store::update_event`].
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub event_type: Option<EventType>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub event_date: Option<chrono::NaiveDate>,
}

impl EventUpdate {
    pub fn apply(&self, event: &mut TimelineEvent) {
        if let Some(event_type) = self.event_type {
            event.event_type = event_type;
        }
        if let Some(title) = &self.title {
            event.title = title.clone();
        }
        if let Some(description) = &self.description {
            event.description = Some(description.clone());
        }
        if let Some(date) = self.event_date {
            event.event_date = date;
        }
    }
}

/// Reject chunks filed under a different owner or document than the one
/// being replaced.
pub fn check_chunk_ownership(owner_id: &str, document_id: &str, chunks: &[Chunk]) -> CoreResult<()> {
    match chunks
        .iter()
        .find(|c| c.owner_id != owner_id || c.document_id != document_id)
    {
        Some(stray) => Err(CoreError::Validation(format!(
            "chunk {} does not belong to document {}",
            stray.id, document_id
        ))),
        None => Ok(()),
    }
}

/// Case-insensitive substring match used by the keyword searches.
pub fn contains_keyword(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle_lower)
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- documents --

    async fn insert_document(&self, doc: &Document) -> CoreResult<()>;

    async fn get_document(&self, owner_id: &str, id: &str) -> CoreResult<Option<Document>>;

    /// Owner's documents, newest upload first.
    async fn list_documents(
        &self,
        owner_id: &str,
        document_type: Option<DocumentType>,
    ) -> CoreResult<Vec<Document>>;

    /// Atomically move a document into `processing`.
    ///
    /// Fails with `Validation` when the document is already `processing`
    /// and `NotFound` when it does not exist for this owner. Clears any
    /// previous `processing_error`.
    async fn begin_processing(&self, owner_id: &str, id: &str) -> CoreResult<Document>;

    /// Settle a document into `status`, recording `error` and `processed_at`.
    ///
    /// Settling as `Failed` also drops the document's chunks, embeddings,
    /// retry entries and extracted text in the same unit, so a failed
    /// document is never searchable.
    async fn finish_processing(
        &self,
        owner_id: &str,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> CoreResult<()>;

    async fn set_extracted_text(&self, owner_id: &str, id: &str, text: &str) -> CoreResult<()>;

    /// Edit tags, metadata or document date. Allowed in every status.
    async fn update_annotations(
        &self,
        owner_id: &str,
        id: &str,
        annotations: &Annotations,
    ) -> CoreResult<Document>;

    /// Delete a document with its chunks, embeddings, retry entries and
    /// chat message references in one unit; entity and timeline references
    /// to it are nulled.
    ///
    /// Returns `false` when nothing was deleted.
    async fn delete_document(&self, owner_id: &str, id: &str) -> CoreResult<bool>;

    // -- chunks --

    /// Replace every chunk of a document in one unit. Embeddings and retry
    /// entries of the old chunks go with them.
    ///
    /// `Validation` when a chunk names another owner or document.
    async fn replace_chunks(
        &self,
        owner_id: &str,
        document_id: &str,
        chunks: &[Chunk],
    ) -> CoreResult<()>;

    /// Chunks of a document ordered by `chunk_index`.
    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> CoreResult<Vec<Chunk>>;

    // -- retry queue --

    /// Insert a retry entry, or add `entry.attempts` to an existing one for
    /// the same (chunk, model) and overwrite its error.
    async fn record_retry(&self, entry: &RetryEntry) -> CoreResult<()>;

    async fn list_retries(&self, owner_id: &str, document_id: &str)
        -> CoreResult<Vec<RetryEntry>>;

    async fn clear_retry(&self, owner_id: &str, chunk_id: &str, model: &str) -> CoreResult<()>;

    // -- entities & timeline --

    /// Fails with `NotFound` when `entity.document_id` names a document the
    /// owner does not have.
    async fn insert_entity(&self, entity: &MedicalEntity) -> CoreResult<()>;

    async fn list_entities(
        &self,
        owner_id: &str,
        entity_type: Option<EntityType>,
    ) -> CoreResult<Vec<MedicalEntity>>;

    async fn get_entity(&self, owner_id: &str, id: &str) -> CoreResult<Option<MedicalEntity>>;

    async fn update_entity(
        &self,
        owner_id: &str,
        id: &str,
        update: &EntityUpdate,
    ) -> CoreResult<MedicalEntity>;

    /// Delete an entity and the chat message references pointing at it.
    async fn delete_entity(&self, owner_id: &str, id: &str) -> CoreResult<bool>;

    async fn insert_event(&self, event: &TimelineEvent) -> CoreResult<()>;

    /// Timeline events, most recent `event_date` first.
    async fn list_events(&self, owner_id: &str) -> CoreResult<Vec<TimelineEvent>>;

    async fn get_event(&self, owner_id: &str, id: &str) -> CoreResult<Option<TimelineEvent>>;

    async fn update_event(
        &self,
        owner_id: &str,
        id: &str,
        update: &EventUpdate,
    ) -> CoreResult<TimelineEvent>;

    async fn delete_event(&self, owner_id: &str, id: &str) -> CoreResult<bool>;

    // -- keyword search --

    /// Documents whose file name or extracted text contains `query`
    /// (ASCII case-insensitive), newest upload first.
    async fn keyword_search_documents(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<Document>>;

    /// Entities whose JSON data contains `query` (ASCII case-insensitive),
    /// newest first.
    async fn keyword_search_entities(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<MedicalEntity>>;
}

/// Owner-scoped store of chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store the vector for a chunk under `model`.
    ///
    /// Returns `false` when the (chunk, model) pair already had a vector;
    /// the stored vector is left untouched. `NotFound` when the chunk does
    /// not exist for this owner, `DimensionMismatch` when `vector` does not
    /// match `model.dims`.
    async fn upsert(
        &self,
        owner_id: &str,
        chunk_id: &str,
        vector: &[f32],
        model: &ModelSpec,
    ) -> CoreResult<bool>;

    /// Top `top_k` chunks of this owner with cosine similarity at least
    /// `min_similarity`, ordered by similarity desc, chunk `created_at` desc,
    /// then `chunk_id` asc.
    async fn query(
        &self,
        owner_id: &str,
        query_vector: &[f32],
        model: &ModelSpec,
        top_k: usize,
        min_similarity: f32,
    ) -> CoreResult<Vec<ScoredChunk>>;

    /// Number of this document's chunks that have a vector under `model`.
    async fn count_embedded(
        &self,
        owner_id: &str,
        document_id: &str,
        model: &str,
    ) -> CoreResult<usize>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, session: &ChatSession) -> CoreResult<()>;

    async fn get_session(&self, owner_id: &str, id: &str) -> CoreResult<Option<ChatSession>>;

    /// Sessions ordered by `last_message_at` desc.
    async fn list_sessions(&self, owner_id: &str) -> CoreResult<Vec<ChatSession>>;

    /// Append a message and bump the session's `last_message_at`.
    ///
    /// `NotFound` when a reference targets a document or entity the
    /// message owner does not have.
    async fn append_message(&self, message: &ChatMessage) -> CoreResult<()>;

    /// Messages in the order they were appended.
    async fn list_messages(&self, owner_id: &str, session_id: &str)
        -> CoreResult<Vec<ChatMessage>>;
}

/// Order hits by similarity desc, `created_at` desc, `chunk_id` asc.
pub fn sort_hits(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
