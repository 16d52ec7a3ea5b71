//! Medical entities, timeline events and keyword search, scoped to the
//! calling owner.
//!
//! Entities and events are written by clients (or a future extraction
//! step) and may point at one of the owner's documents. Keyword search is
//! a plain case-insensitive substring match that complements the semantic
//! search in [`crate::services::Services::search`].

use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{Document, EntityType, EventType, MedicalEntity, TimelineEvent};
use healthflow_core::store::{EntityUpdate, EventUpdate, Store};

use crate::config::RetrievalConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct NewEntity {
    #[serde(default)]
    pub document_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_data: serde_json::Value,
    #[serde(default)]
    pub entity_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub extraction_confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub document_id: Option<String>,
    pub event_type: EventType,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub event_date: chrono::NaiveDate,
}

pub struct RecordService {
    store: Arc<dyn Store>,
    default_limit: usize,
    max_limit: usize,
}

fn check_entity_data(data: &serde_json::Value) -> CoreResult<()> {
    if !data.is_object() {
        return Err(CoreError::Validation(
            "entity_data must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

fn check_title(title: &str) -> CoreResult<()> {
    if title.trim().is_empty() {
        return Err(CoreError::Validation("title is required".to_string()));
    }
    Ok(())
}

impl RecordService {
    pub fn new(store: Arc<dyn Store>, retrieval: &RetrievalConfig) -> Self {
        Self {
            store,
            default_limit: retrieval.default_limit,
            max_limit: retrieval.max_top_k,
        }
    }

    pub async fn create_entity(&self, owner_id: &str, new: NewEntity) -> CoreResult<MedicalEntity> {
        check_entity_data(&new.entity_data)?;
        if let Some(confidence) = new.extraction_confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(CoreError::Validation(
                    "extraction_confidence must be between 0 and 1".to_string(),
                ));
            }
        }
        let entity = MedicalEntity {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            document_id: new.document_id,
            entity_type: new.entity_type,
            entity_data: new.entity_data,
            entity_date: new.entity_date,
            extraction_confidence: new.extraction_confidence,
            is_verified: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.insert_entity(&entity).await?;
        tracing::debug!(entity_id = %entity.id, entity_type = %entity.entity_type, "entity recorded");
        Ok(entity)
    }

    pub async fn list_entities(
        &self,
        owner_id: &str,
        entity_type: Option<EntityType>,
    ) -> CoreResult<Vec<MedicalEntity>> {
        self.store.list_entities(owner_id, entity_type).await
    }

    pub async fn get_entity(&self, owner_id: &str, id: &str) -> CoreResult<MedicalEntity> {
        self.store
            .get_entity(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("medical entity"))
    }

    pub async fn update_entity(
        &self,
        owner_id: &str,
        id: &str,
        update: &EntityUpdate,
    ) -> CoreResult<MedicalEntity> {
        if let Some(data) = &update.entity_data {
            check_entity_data(data)?;
        }
        self.store.update_entity(owner_id, id, update).await
    }

    pub async fn delete_entity(&self, owner_id: &str, id: &str) -> CoreResult<()> {
        if !self.store.delete_entity(owner_id, id).await? {
            return Err(CoreError::not_found("medical entity"));
        }
        Ok(())
    }

    pub async fn create_event(&self, owner_id: &str, new: NewEvent) -> CoreResult<TimelineEvent> {
        check_title(&new.title)?;
        let event = TimelineEvent {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            document_id: new.document_id,
            event_type: new.event_type,
            title: new.title.trim().to_string(),
            description: new.description,
            event_date: new.event_date,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.insert_event(&event).await?;
        Ok(event)
    }

    pub async fn list_events(&self, owner_id: &str) -> CoreResult<Vec<TimelineEvent>> {
        self.store.list_events(owner_id).await
    }

    pub async fn get_event(&self, owner_id: &str, id: &str) -> CoreResult<TimelineEvent> {
        self.store
            .get_event(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("timeline event"))
    }

    pub async fn update_event(
        &self,
        owner_id: &str,
        id: &str,
        update: &EventUpdate,
    ) -> CoreResult<TimelineEvent> {
        if let Some(title) = &update.title {
            check_title(title)?;
        }
        self.store.update_event(owner_id, id, update).await
    }

    pub async fn delete_event(&self, owner_id: &str, id: &str) -> CoreResult<()> {
        if !self.store.delete_event(owner_id, id).await? {
            return Err(CoreError::not_found("timeline event"));
        }
        Ok(())
    }

    /// Blank queries are rejected; the limit defaults to
    /// `retrieval.default_limit` and is clamped to `retrieval.max_top_k`.
    fn keyword_params<'q>(&self, query: &'q str, limit: Option<usize>) -> CoreResult<(&'q str, usize)> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::Validation("query must not be empty".to_string()));
        }
        let limit = limit.unwrap_or(self.default_limit).min(self.max_limit);
        Ok((query, limit))
    }

    pub async fn search_documents(
        &self,
        owner_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Document>> {
        let (query, limit) = self.keyword_params(query, limit)?;
        self.store
            .keyword_search_documents(owner_id, query, limit)
            .await
    }

    pub async fn search_entities(
        &self,
        owner_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> CoreResult<Vec<MedicalEntity>> {
        let (query, limit) = self.keyword_params(query, limit)?;
        self.store.keyword_search_entities(owner_id, query, limit).await
    }
}
