//! In-memory [`Store`], [`VectorIndex`] and [`ChatStore`] for tests and
//! WASM targets.
//!
//! All tables sit behind one `std::sync::RwLock`, so multi-table operations
//! (chunk replacement, cascading delete) are atomic. Vector search is
//! brute-force cosine similarity over the owner's vectors.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    ChatMessage, ChatSession, Chunk, Document, DocumentType, EntityType, MedicalEntity,
    ModelSpec, ProcessingStatus, ReferenceTarget, RetryEntry, ScoredChunk, TimelineEvent,
};

use super::{
    check_chunk_ownership, contains_keyword, sort_hits, Annotations, ChatStore, EntityUpdate,
    EventUpdate, Store, VectorIndex,
};

struct StoredVector {
    chunk_id: String,
    model: String,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Tables {
    docs: HashMap<String, Document>,
    chunks: Vec<Chunk>,
    vectors: Vec<StoredVector>,
    retries: Vec<RetryEntry>,
    entities: Vec<MedicalEntity>,
    events: Vec<TimelineEvent>,
    sessions: HashMap<String, ChatSession>,
    messages: Vec<ChatMessage>,
}

impl Tables {
    fn owned_doc(&self, owner_id: &str, id: &str) -> Option<&Document> {
        self.docs.get(id).filter(|d| d.owner_id == owner_id)
    }

    fn owned_doc_mut(&mut self, owner_id: &str, id: &str) -> CoreResult<&mut Document> {
        self.docs
            .get_mut(id)
            .filter(|d| d.owner_id == owner_id)
            .ok_or_else(|| CoreError::not_found("document"))
    }

    fn drop_chunks_of(&mut self, document_id: &str) {
        let doomed: Vec<String> = self
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        self.chunks.retain(|c| c.document_id != document_id);
        self.vectors.retain(|v| !doomed.contains(&v.chunk_id));
        self.retries.retain(|r| r.document_id != document_id);
    }

    fn drop_references_to(&mut self, target: &ReferenceTarget) {
        for message in self.messages.iter_mut() {
            message.references.retain(|r| &r.target != target);
        }
    }

    fn owns_target(&self, owner_id: &str, target: &ReferenceTarget) -> bool {
        match target {
            ReferenceTarget::Document(id) => self.owned_doc(owner_id, id).is_some(),
            ReferenceTarget::MedicalEntity(id) => self
                .entities
                .iter()
                .any(|e| &e.id == id && e.owner_id == owner_id),
        }
    }
}

/// In-memory store for testing and WASM environments.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        let mut t = self.write();
        if t.docs.contains_key(&doc.id) {
            return Err(CoreError::Validation(format!(
                "document {} already exists",
                doc.id
            )));
        }
        t.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, owner_id: &str, id: &str) -> CoreResult<Option<Document>> {
        Ok(self.read().owned_doc(owner_id, id).cloned())
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        document_type: Option<DocumentType>,
    ) -> CoreResult<Vec<Document>> {
        let t = self.read();
        let mut docs: Vec<Document> = t
            .docs
            .values()
            .filter(|d| d.owner_id == owner_id)
            .filter(|d| document_type.map_or(true, |ty| d.document_type == ty))
            .cloned()
            .collect();
        docs.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(docs)
    }

    async fn begin_processing(&self, owner_id: &str, id: &str) -> CoreResult<Document> {
        let mut t = self.write();
        let doc = t.owned_doc_mut(owner_id, id)?;
        if doc.processing_status == ProcessingStatus::Processing {
            return Err(CoreError::Validation(format!(
                "document {} is already being processed",
                id
            )));
        }
        doc.processing_status = ProcessingStatus::Processing;
        doc.processing_error = None;
        doc.updated_at = now_ts();
        Ok(doc.clone())
    }

    async fn finish_processing(
        &self,
        owner_id: &str,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        let mut t = self.write();
        let doc = t.owned_doc_mut(owner_id, id)?;
        let now = now_ts();
        doc.processing_status = status;
        doc.processing_error = error.map(str::to_string);
        doc.processed_at = Some(now);
        doc.updated_at = now;
        if status == ProcessingStatus::Failed {
            doc.extracted_text = None;
            t.drop_chunks_of(id);
        }
        Ok(())
    }

    async fn set_extracted_text(&self, owner_id: &str, id: &str, text: &str) -> CoreResult<()> {
        let mut t = self.write();
        let doc = t.owned_doc_mut(owner_id, id)?;
        doc.extracted_text = Some(text.to_string());
        doc.updated_at = now_ts();
        Ok(())
    }

    async fn update_annotations(
        &self,
        owner_id: &str,
        id: &str,
        annotations: &Annotations,
    ) -> CoreResult<Document> {
        let mut t = self.write();
        let doc = t.owned_doc_mut(owner_id, id)?;
        if let Some(tags) = &annotations.tags {
            doc.tags = tags.clone();
        }
        if let Some(metadata) = &annotations.metadata {
            doc.metadata = metadata.clone();
        }
        if let Some(date) = annotations.document_date {
            doc.document_date = Some(date);
        }
        doc.updated_at = now_ts();
        Ok(doc.clone())
    }

    async fn delete_document(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let mut t = self.write();
        if t.owned_doc(owner_id, id).is_none() {
            return Ok(false);
        }
        t.drop_chunks_of(id);
        t.drop_references_to(&ReferenceTarget::Document(id.to_string()));
        t.docs.remove(id);
        for entity in t.entities.iter_mut() {
            if entity.document_id.as_deref() == Some(id) {
                entity.document_id = None;
            }
        }
        for event in t.events.iter_mut() {
            if event.document_id.as_deref() == Some(id) {
                event.document_id = None;
            }
        }
        Ok(true)
    }

    async fn replace_chunks(
        &self,
        owner_id: &str,
        document_id: &str,
        chunks: &[Chunk],
    ) -> CoreResult<()> {
        let mut t = self.write();
        if t.owned_doc(owner_id, document_id).is_none() {
            return Err(CoreError::not_found("document"));
        }
        check_chunk_ownership(owner_id, document_id, chunks)?;
        t.drop_chunks_of(document_id);
        t.chunks.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> CoreResult<Vec<Chunk>> {
        let t = self.read();
        let mut chunks: Vec<Chunk> = t
            .chunks
            .iter()
            .filter(|c| c.owner_id == owner_id && c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn record_retry(&self, entry: &RetryEntry) -> CoreResult<()> {
        let mut t = self.write();
        let chunk_exists = t
            .chunks
            .iter()
            .any(|c| c.id == entry.chunk_id && c.owner_id == entry.owner_id);
        if !chunk_exists {
            return Err(CoreError::not_found("chunk"));
        }
        match t
            .retries
            .iter_mut()
            .find(|r| r.chunk_id == entry.chunk_id && r.model == entry.model)
        {
            Some(existing) => {
                existing.attempts += entry.attempts;
                existing.last_error = entry.last_error.clone();
                existing.updated_at = entry.updated_at;
            }
            None => t.retries.push(entry.clone()),
        }
        Ok(())
    }

    async fn list_retries(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> CoreResult<Vec<RetryEntry>> {
        let t = self.read();
        Ok(t.retries
            .iter()
            .filter(|r| r.owner_id == owner_id && r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn clear_retry(&self, owner_id: &str, chunk_id: &str, model: &str) -> CoreResult<()> {
        self.write()
            .retries
            .retain(|r| !(r.owner_id == owner_id && r.chunk_id == chunk_id && r.model == model));
        Ok(())
    }

    async fn insert_entity(&self, entity: &MedicalEntity) -> CoreResult<()> {
        let mut t = self.write();
        if let Some(doc_id) = &entity.document_id {
            if t.owned_doc(&entity.owner_id, doc_id).is_none() {
                return Err(CoreError::not_found("document"));
            }
        }
        t.entities.push(entity.clone());
        Ok(())
    }

    async fn list_entities(
        &self,
        owner_id: &str,
        entity_type: Option<EntityType>,
    ) -> CoreResult<Vec<MedicalEntity>> {
        let t = self.read();
        Ok(t.entities
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .filter(|e| entity_type.map_or(true, |ty| e.entity_type == ty))
            .cloned()
            .collect())
    }

    async fn get_entity(&self, owner_id: &str, id: &str) -> CoreResult<Option<MedicalEntity>> {
        Ok(self
            .read()
            .entities
            .iter()
            .find(|e| e.id == id && e.owner_id == owner_id)
            .cloned())
    }

    async fn update_entity(
        &self,
        owner_id: &str,
        id: &str,
        update: &EntityUpdate,
    ) -> CoreResult<MedicalEntity> {
        let mut t = self.write();
        let entity = t
            .entities
            .iter_mut()
            .find(|e| e.id == id && e.owner_id == owner_id)
            .ok_or_else(|| CoreError::not_found("medical entity"))?;
        update.apply(entity);
        Ok(entity.clone())
    }

    async fn delete_entity(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let mut t = self.write();
        let before = t.entities.len();
        t.entities.retain(|e| !(e.id == id && e.owner_id == owner_id));
        if t.entities.len() == before {
            return Ok(false);
        }
        t.drop_references_to(&ReferenceTarget::MedicalEntity(id.to_string()));
        Ok(true)
    }

    async fn insert_event(&self, event: &TimelineEvent) -> CoreResult<()> {
        let mut t = self.write();
        if let Some(doc_id) = &event.document_id {
            if t.owned_doc(&event.owner_id, doc_id).is_none() {
                return Err(CoreError::not_found("document"));
            }
        }
        t.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, owner_id: &str) -> CoreResult<Vec<TimelineEvent>> {
        let t = self.read();
        let mut events: Vec<TimelineEvent> = t
            .events
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            b.event_date
                .cmp(&a.event_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(events)
    }

    async fn get_event(&self, owner_id: &str, id: &str) -> CoreResult<Option<TimelineEvent>> {
        Ok(self
            .read()
            .events
            .iter()
            .find(|e| e.id == id && e.owner_id == owner_id)
            .cloned())
    }

    async fn update_event(
        &self,
        owner_id: &str,
        id: &str,
        update: &EventUpdate,
    ) -> CoreResult<TimelineEvent> {
        let mut t = self.write();
        let event = t
            .events
            .iter_mut()
            .find(|e| e.id == id && e.owner_id == owner_id)
            .ok_or_else(|| CoreError::not_found("timeline event"))?;
        update.apply(event);
        Ok(event.clone())
    }

    async fn delete_event(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let mut t = self.write();
        let before = t.events.len();
        t.events.retain(|e| !(e.id == id && e.owner_id == owner_id));
        Ok(t.events.len() != before)
    }

    async fn keyword_search_documents(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<Document>> {
        let needle = query.to_ascii_lowercase();
        let t = self.read();
        let mut docs: Vec<Document> = t
            .docs
            .values()
            .filter(|d| d.owner_id == owner_id)
            .filter(|d| {
                contains_keyword(&d.file_name, &needle)
                    || d
                        .extracted_text
                        .as_deref()
                        .is_some_and(|text| contains_keyword(text, &needle))
            })
            .cloned()
            .collect();
        docs.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        docs.truncate(limit);
        Ok(docs)
    }

    async fn keyword_search_entities(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<MedicalEntity>> {
        let needle = query.to_ascii_lowercase();
        let t = self.read();
        let mut entities: Vec<MedicalEntity> = t
            .entities
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .filter(|e| contains_keyword(&e.entity_data.to_string(), &needle))
            .cloned()
            .collect();
        entities.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        entities.truncate(limit);
        Ok(entities)
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn upsert(
        &self,
        owner_id: &str,
        chunk_id: &str,
        vector: &[f32],
        model: &ModelSpec,
    ) -> CoreResult<bool> {
        if vector.len() != model.dims {
            return Err(CoreError::DimensionMismatch {
                expected: model.dims,
                actual: vector.len(),
            });
        }
        let mut t = self.write();
        let chunk_exists = t
            .chunks
            .iter()
            .any(|c| c.id == chunk_id && c.owner_id == owner_id);
        if !chunk_exists {
            return Err(CoreError::not_found("chunk"));
        }
        if t
            .vectors
            .iter()
            .any(|v| v.chunk_id == chunk_id && v.model == model.name)
        {
            return Ok(false);
        }
        t.vectors.push(StoredVector {
            chunk_id: chunk_id.to_string(),
            model: model.name.clone(),
            vector: vector.to_vec(),
        });
        Ok(true)
    }

    async fn query(
        &self,
        owner_id: &str,
        query_vector: &[f32],
        model: &ModelSpec,
        top_k: usize,
        min_similarity: f32,
    ) -> CoreResult<Vec<ScoredChunk>> {
        if query_vector.len() != model.dims {
            return Err(CoreError::DimensionMismatch {
                expected: model.dims,
                actual: query_vector.len(),
            });
        }
        let t = self.read();
        let chunks: HashMap<&str, &Chunk> = t
            .chunks
            .iter()
            .filter(|c| c.owner_id == owner_id && t.docs.contains_key(&c.document_id))
            .map(|c| (c.id.as_str(), c))
            .collect();

        let mut hits: Vec<ScoredChunk> = t
            .vectors
            .iter()
            .filter(|v| v.model == model.name)
            .filter_map(|v| {
                let chunk = chunks.get(v.chunk_id.as_str())?;
                let similarity = cosine_similarity(query_vector, &v.vector);
                (similarity >= min_similarity).then(|| ScoredChunk {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    chunk_index: chunk.chunk_index,
                    similarity,
                    created_at: chunk.created_at,
                    text: chunk.text.clone(),
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count_embedded(
        &self,
        owner_id: &str,
        document_id: &str,
        model: &str,
    ) -> CoreResult<usize> {
        let t = self.read();
        Ok(t.vectors
            .iter()
            .filter(|v| v.model == model)
            .filter(|v| {
                t.chunks.iter().any(|c| {
                    c.id == v.chunk_id && c.owner_id == owner_id && c.document_id == document_id
                })
            })
            .count())
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_session(&self, session: &ChatSession) -> CoreResult<()> {
        self.write()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, owner_id: &str, id: &str) -> CoreResult<Option<ChatSession>> {
        Ok(self
            .read()
            .sessions
            .get(id)
            .filter(|s| s.owner_id == owner_id)
            .cloned())
    }

    async fn list_sessions(&self, owner_id: &str) -> CoreResult<Vec<ChatSession>> {
        let t = self.read();
        let mut sessions: Vec<ChatSession> = t
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }

    async fn append_message(&self, message: &ChatMessage) -> CoreResult<()> {
        let mut t = self.write();
        if let Some(stray) = message
            .references
            .iter()
            .find(|r| !t.owns_target(&message.owner_id, &r.target))
        {
            return Err(CoreError::not_found(match stray.target {
                ReferenceTarget::Document(_) => "document",
                ReferenceTarget::MedicalEntity(_) => "medical entity",
            }));
        }
        let session = t
            .sessions
            .get_mut(&message.session_id)
            .filter(|s| s.owner_id == message.owner_id)
            .ok_or_else(|| CoreError::not_found("chat session"))?;
        session.last_message_at = session.last_message_at.max(message.created_at);
        t.messages.push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> CoreResult<Vec<ChatMessage>> {
        let t = self.read();
        if !t
            .sessions
            .get(session_id)
            .is_some_and(|s| s.owner_id == owner_id)
        {
            return Err(CoreError::not_found("chat session"));
        }
        Ok(t.messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }
}
