//! SQLite-backed [`Store`], [`VectorIndex`] and [`ChatStore`].
//!
//! Multi-row changes (chunk replacement, cascading delete, message append)
//! run inside one transaction. Vector search is brute-force cosine
//! similarity over the owner's embeddings, joined to `documents` so that
//! chunks of a deleted document never surface.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use healthflow_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{
    ChatMessage, ChatSession, Chunk, Document, DocumentType, EntityType, MedicalEntity,
    MessageReference, ModelSpec, ProcessingStatus, ReferenceTarget, RetryEntry, ScoredChunk,
    TimelineEvent,
};
use healthflow_core::store::{
    check_chunk_ownership, sort_hits, Annotations, ChatStore, EntityUpdate, EventUpdate, Store,
    VectorIndex,
};

/// SQLite implementation of the storage traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn document_exists(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ? AND owner_id = ?")
                .bind(id)
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(exists)
    }

    async fn chunk_exists(&self, owner_id: &str, chunk_id: &str) -> CoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE id = ? AND owner_id = ?")
                .bind(chunk_id)
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(exists)
    }
}

/// Remove a document's chunks with their embeddings and retry entries.
async fn drop_chunks_of(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
) -> CoreResult<()> {
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    sqlx::query("DELETE FROM embedding_retries WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.into())
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> CoreResult<T> {
    value.parse::<T>().map_err(|e| CoreError::Storage(anyhow!(e)))
}

fn parse_date(value: Option<String>) -> CoreResult<Option<NaiveDate>> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| CoreError::Storage(anyhow!("bad date '{}': {}", s, e)))
        })
        .transpose()
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn json_err(e: serde_json::Error) -> CoreError {
    CoreError::Storage(e.into())
}

const DOCUMENT_COLUMNS: &str = "id, owner_id, file_name, storage_path, mime_type, file_size, \
     document_type, processing_status, processing_error, extracted_text, metadata_json, \
     tags_json, document_date, uploaded_at, processed_at, created_at, updated_at";

fn document_from_row(row: &SqliteRow) -> CoreResult<Document> {
    let metadata_json: String = row.get("metadata_json");
    let tags_json: String = row.get("tags_json");
    let document_type: String = row.get("document_type");
    let status: String = row.get("processing_status");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        file_name: row.get("file_name"),
        storage_path: row.get("storage_path"),
        mime_type: row.get("mime_type"),
        file_size: row.get("file_size"),
        document_type: parse_enum(&document_type)?,
        processing_status: parse_enum(&status)?,
        processing_error: row.get("processing_error"),
        extracted_text: row.get("extracted_text"),
        metadata: serde_json::from_str(&metadata_json).map_err(json_err)?,
        tags: serde_json::from_str(&tags_json).map_err(json_err)?,
        document_date: parse_date(row.get("document_date"))?,
        uploaded_at: row.get("uploaded_at"),
        processed_at: row.get("processed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        owner_id: row.get("owner_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        char_count: row.get("char_count"),
        hash: row.get("hash"),
        created_at: row.get("created_at"),
    }
}

fn retry_from_row(row: &SqliteRow) -> RetryEntry {
    RetryEntry {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        owner_id: row.get("owner_id"),
        model: row.get("model"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        updated_at: row.get("updated_at"),
    }
}

fn entity_from_row(row: &SqliteRow) -> CoreResult<MedicalEntity> {
    let entity_type: String = row.get("entity_type");
    let data: String = row.get("entity_data_json");
    Ok(MedicalEntity {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        document_id: row.get("document_id"),
        entity_type: parse_enum(&entity_type)?,
        entity_data: serde_json::from_str(&data).map_err(json_err)?,
        entity_date: parse_date(row.get("entity_date"))?,
        extraction_confidence: row.get("extraction_confidence"),
        is_verified: row.get("is_verified"),
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &SqliteRow) -> CoreResult<TimelineEvent> {
    let event_type: String = row.get("event_type");
    let event_date: Option<String> = row.get("event_date");
    Ok(TimelineEvent {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        document_id: row.get("document_id"),
        event_type: parse_enum(&event_type)?,
        title: row.get("title"),
        description: row.get("description"),
        event_date: parse_date(event_date)?
            .ok_or_else(|| CoreError::Storage(anyhow!("timeline event without date")))?,
        created_at: row.get("created_at"),
    })
}

fn session_from_row(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        started_at: row.get("started_at"),
        last_message_at: row.get("last_message_at"),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        let metadata_json = serde_json::to_string(&doc.metadata).map_err(json_err)?;
        let tags_json = serde_json::to_string(&doc.tags).map_err(json_err)?;
        sqlx::query(&format!(
            "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.file_name)
        .bind(&doc.storage_path)
        .bind(&doc.mime_type)
        .bind(doc.file_size)
        .bind(doc.document_type.as_str())
        .bind(doc.processing_status.as_str())
        .bind(&doc.processing_error)
        .bind(&doc.extracted_text)
        .bind(&metadata_json)
        .bind(&tags_json)
        .bind(format_date(doc.document_date))
        .bind(doc.uploaded_at)
        .bind(doc.processed_at)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_document(&self, owner_id: &str, id: &str) -> CoreResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ? AND owner_id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        document_type: Option<DocumentType>,
    ) -> CoreResult<Vec<Document>> {
        let type_filter = document_type.map(|t| t.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents \
             WHERE owner_id = ? AND (? IS NULL OR document_type = ?) \
             ORDER BY uploaded_at DESC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(type_filter)
        .bind(type_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn begin_processing(&self, owner_id: &str, id: &str) -> CoreResult<Document> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET processing_status = 'processing', processing_error = NULL, updated_at = ?
            WHERE id = ? AND owner_id = ? AND processing_status != 'processing'
            "#,
        )
        .bind(now_ts())
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            if self.document_exists(owner_id, id).await? {
                return Err(CoreError::Validation(format!(
                    "document {} is already being processed",
                    id
                )));
            }
            return Err(CoreError::not_found("document"));
        }

        self.get_document(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))
    }

    async fn finish_processing(
        &self,
        owner_id: &str,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        let now = now_ts();
        let failed = status == ProcessingStatus::Failed;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET processing_status = ?, processing_error = ?, processed_at = ?, updated_at = ?,
                extracted_text = CASE WHEN ? THEN NULL ELSE extracted_text END
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(failed)
        .bind(id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("document"));
        }
        if failed {
            drop_chunks_of(&mut tx, id).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn set_extracted_text(&self, owner_id: &str, id: &str, text: &str) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET extracted_text = ?, updated_at = ? WHERE id = ? AND owner_id = ?",
        )
        .bind(text)
        .bind(now_ts())
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("document"));
        }
        Ok(())
    }

    async fn update_annotations(
        &self,
        owner_id: &str,
        id: &str,
        annotations: &Annotations,
    ) -> CoreResult<Document> {
        let tags_json = annotations
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;
        let metadata_json = annotations
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET tags_json = COALESCE(?, tags_json),
                metadata_json = COALESCE(?, metadata_json),
                document_date = COALESCE(?, document_date),
                updated_at = ?
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(tags_json)
        .bind(metadata_json)
        .bind(format_date(annotations.document_date))
        .bind(now_ts())
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("document"));
        }

        self.get_document(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))
    }

    async fn delete_document(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let owned: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ? AND owner_id = ?")
                .bind(id)
                .bind(owner_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        if !owned {
            return Ok(false);
        }

        drop_chunks_of(&mut tx, id).await?;
        sqlx::query("DELETE FROM message_references WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE medical_entities SET document_id = NULL WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE timeline_events SET document_id = NULL WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM documents WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn replace_chunks(
        &self,
        owner_id: &str,
        document_id: &str,
        chunks: &[Chunk],
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let owned: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ? AND owner_id = ?")
                .bind(document_id)
                .bind(owner_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        if !owned {
            return Err(CoreError::not_found("document"));
        }
        check_chunk_ownership(owner_id, document_id, chunks)?;

        drop_chunks_of(&mut tx, document_id).await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, owner_id, chunk_index, text, char_count, hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.owner_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.char_count)
            .bind(&chunk.hash)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> CoreResult<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, owner_id, chunk_index, text, char_count, hash, created_at
            FROM chunks
            WHERE document_id = ? AND owner_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn record_retry(&self, entry: &RetryEntry) -> CoreResult<()> {
        if !self.chunk_exists(&entry.owner_id, &entry.chunk_id).await? {
            return Err(CoreError::not_found("chunk"));
        }
        sqlx::query(
            r#"
            INSERT INTO embedding_retries
                (chunk_id, document_id, owner_id, model, attempts, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id, model) DO UPDATE SET
                attempts = embedding_retries.attempts + excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.chunk_id)
        .bind(&entry.document_id)
        .bind(&entry.owner_id)
        .bind(&entry.model)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_retries(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> CoreResult<Vec<RetryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT r.chunk_id, r.document_id, r.owner_id, r.model, r.attempts, r.last_error, r.updated_at
            FROM embedding_retries r
            JOIN chunks c ON c.id = r.chunk_id
            WHERE r.document_id = ? AND r.owner_id = ?
            ORDER BY c.chunk_index ASC, r.model ASC
            "#,
        )
        .bind(document_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(retry_from_row).collect())
    }

    async fn clear_retry(&self, owner_id: &str, chunk_id: &str, model: &str) -> CoreResult<()> {
        sqlx::query(
            "DELETE FROM embedding_retries WHERE chunk_id = ? AND model = ? AND owner_id = ?",
        )
        .bind(chunk_id)
        .bind(model)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_entity(&self, entity: &MedicalEntity) -> CoreResult<()> {
        if let Some(doc_id) = &entity.document_id {
            if !self.document_exists(&entity.owner_id, doc_id).await? {
                return Err(CoreError::not_found("document"));
            }
        }
        let data = serde_json::to_string(&entity.entity_data).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO medical_entities
                (id, owner_id, document_id, entity_type, entity_data_json, entity_date,
                 extraction_confidence, is_verified, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.owner_id)
        .bind(&entity.document_id)
        .bind(entity.entity_type.as_str())
        .bind(&data)
        .bind(format_date(entity.entity_date))
        .bind(entity.extraction_confidence)
        .bind(entity.is_verified)
        .bind(entity.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_entities(
        &self,
        owner_id: &str,
        entity_type: Option<EntityType>,
    ) -> CoreResult<Vec<MedicalEntity>> {
        let type_filter = entity_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, document_id, entity_type, entity_data_json, entity_date,
                   extraction_confidence, is_verified, created_at
            FROM medical_entities
            WHERE owner_id = ? AND (? IS NULL OR entity_type = ?)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(owner_id)
        .bind(type_filter)
        .bind(type_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get_entity(&self, owner_id: &str, id: &str) -> CoreResult<Option<MedicalEntity>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, document_id, entity_type, entity_data_json, entity_date,
                   extraction_confidence, is_verified, created_at
            FROM medical_entities
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn update_entity(
        &self,
        owner_id: &str,
        id: &str,
        update: &EntityUpdate,
    ) -> CoreResult<MedicalEntity> {
        let mut entity = self
            .get_entity(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("medical entity"))?;
        update.apply(&mut entity);
        let data = serde_json::to_string(&entity.entity_data).map_err(json_err)?;
        let result = sqlx::query(
            r#"
            UPDATE medical_entities
            SET entity_type = ?, entity_data_json = ?, entity_date = ?, is_verified = ?
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(entity.entity_type.as_str())
        .bind(&data)
        .bind(format_date(entity.entity_date))
        .bind(entity.is_verified)
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("medical entity"));
        }
        Ok(entity)
    }

    async fn delete_entity(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let owned: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM medical_entities WHERE id = ? AND owner_id = ?",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if !owned {
            return Ok(false);
        }
        sqlx::query("DELETE FROM message_references WHERE medical_entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM medical_entities WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn insert_event(&self, event: &TimelineEvent) -> CoreResult<()> {
        if let Some(doc_id) = &event.document_id {
            if !self.document_exists(&event.owner_id, doc_id).await? {
                return Err(CoreError::not_found("document"));
            }
        }
        sqlx::query(
            r#"
            INSERT INTO timeline_events
                (id, owner_id, document_id, event_type, title, description, event_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.owner_id)
        .bind(&event.document_id)
        .bind(event.event_type.as_str())
        .bind(&event.title)
        .bind(&event.description)
        .bind(format_date(Some(event.event_date)))
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_events(&self, owner_id: &str) -> CoreResult<Vec<TimelineEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, document_id, event_type, title, description, event_date, created_at
            FROM timeline_events
            WHERE owner_id = ?
            ORDER BY event_date DESC, created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_event(&self, owner_id: &str, id: &str) -> CoreResult<Option<TimelineEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, document_id, event_type, title, description, event_date, created_at
            FROM timeline_events
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn update_event(
        &self,
        owner_id: &str,
        id: &str,
        update: &EventUpdate,
    ) -> CoreResult<TimelineEvent> {
        let mut event = self
            .get_event(owner_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found("timeline event"))?;
        update.apply(&mut event);
        let result = sqlx::query(
            r#"
            UPDATE timeline_events
            SET event_type = ?, title = ?, description = ?, event_date = ?
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(&event.title)
        .bind(&event.description)
        .bind(format_date(Some(event.event_date)))
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("timeline event"));
        }
        Ok(event)
    }

    async fn delete_event(&self, owner_id: &str, id: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM timeline_events WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn keyword_search_documents(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<Document>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM documents
            WHERE owner_id = ?
              AND (instr(lower(file_name), lower(?)) > 0
                   OR instr(lower(COALESCE(extracted_text, '')), lower(?)) > 0)
            ORDER BY uploaded_at DESC, id ASC
            LIMIT ?
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(query)
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn keyword_search_entities(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<MedicalEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, document_id, entity_type, entity_data_json, entity_date,
                   extraction_confidence, is_verified, created_at
            FROM medical_entities
            WHERE owner_id = ? AND instr(lower(entity_data_json), lower(?)) > 0
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entity_from_row).collect()
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
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
        let blob = vec_to_blob(vector);

        // Single statement: the chunk lookup and the insert cannot be split
        // by a concurrent document delete.
        let result = sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, owner_id, model, dims, embedding, created_at)
            SELECT id, owner_id, ?, ?, ?, ?
            FROM chunks
            WHERE id = ? AND owner_id = ?
            ON CONFLICT(chunk_id, model) DO NOTHING
            "#,
        )
        .bind(&model.name)
        .bind(model.dims as i64)
        .bind(&blob)
        .bind(now_ts())
        .bind(chunk_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.chunk_exists(owner_id, chunk_id).await? {
            Ok(false)
        } else {
            Err(CoreError::not_found("chunk"))
        }
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
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.embedding, c.document_id, c.chunk_index, c.created_at, c.text
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE e.owner_id = ? AND c.owner_id = ? AND d.owner_id = ?
              AND e.model = ? AND e.dims = ?
            "#,
        )
        .bind(owner_id)
        .bind(owner_id)
        .bind(owner_id)
        .bind(&model.name)
        .bind(model.dims as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vector, &blob_to_vec(&blob));
                (similarity >= min_similarity).then(|| ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    similarity,
                    created_at: row.get("created_at"),
                    text: row.get("text"),
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
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            WHERE c.document_id = ? AND c.owner_id = ? AND e.model = ?
            "#,
        )
        .bind(document_id)
        .bind(owner_id)
        .bind(model)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_session(&self, session: &ChatSession) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, title, started_at, last_message_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.title)
        .bind(session.started_at)
        .bind(session.last_message_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(&self, owner_id: &str, id: &str) -> CoreResult<Option<ChatSession>> {
        let row = sqlx::query(
            "SELECT id, owner_id, title, started_at, last_message_at FROM chat_sessions WHERE id = ? AND owner_id = ?",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn list_sessions(&self, owner_id: &str) -> CoreResult<Vec<ChatSession>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, title, started_at, last_message_at
            FROM chat_sessions
            WHERE owner_id = ?
            ORDER BY last_message_at DESC, id ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn append_message(&self, message: &ChatMessage) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET last_message_at = MAX(last_message_at, ?)
            WHERE id = ? AND owner_id = ?
            "#,
        )
        .bind(message.created_at)
        .bind(&message.session_id)
        .bind(&message.owner_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("chat session"));
        }

        for reference in &message.references {
            let (sql, what, id) = match &reference.target {
                ReferenceTarget::Document(id) => (
                    "SELECT COUNT(*) > 0 FROM documents WHERE id = ? AND owner_id = ?",
                    "document",
                    id,
                ),
                ReferenceTarget::MedicalEntity(id) => (
                    "SELECT COUNT(*) > 0 FROM medical_entities WHERE id = ? AND owner_id = ?",
                    "medical entity",
                    id,
                ),
            };
            let owned: bool = sqlx::query_scalar(sql)
                .bind(id)
                .bind(&message.owner_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
            if !owned {
                return Err(CoreError::not_found(what));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, owner_id, role, content, model_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(&message.owner_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.model_name)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for reference in &message.references {
            let (document_id, entity_id) = match &reference.target {
                ReferenceTarget::Document(id) => (Some(id.as_str()), None),
                ReferenceTarget::MedicalEntity(id) => (None, Some(id.as_str())),
            };
            sqlx::query(
                r#"
                INSERT INTO message_references (message_id, document_id, medical_entity_id, relevance_score)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(document_id)
            .bind(entity_id)
            .bind(reference.relevance_score)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> CoreResult<Vec<ChatMessage>> {
        if self.get_session(owner_id, session_id).await?.is_none() {
            return Err(CoreError::not_found("chat session"));
        }

        let ref_rows = sqlx::query(
            r#"
            SELECT r.message_id, r.document_id, r.medical_entity_id, r.relevance_score
            FROM message_references r
            JOIN chat_messages m ON m.id = r.message_id
            WHERE m.session_id = ?
            ORDER BY r.seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut references: HashMap<String, Vec<MessageReference>> = HashMap::new();
        for row in &ref_rows {
            let document_id: Option<String> = row.get("document_id");
            let entity_id: Option<String> = row.get("medical_entity_id");
            let target = match (document_id, entity_id) {
                (Some(id), None) => ReferenceTarget::Document(id),
                (None, Some(id)) => ReferenceTarget::MedicalEntity(id),
                _ => {
                    return Err(CoreError::Storage(anyhow!(
                        "message reference must point at exactly one target"
                    )))
                }
            };
            references
                .entry(row.get("message_id"))
                .or_default()
                .push(MessageReference {
                    target,
                    relevance_score: row.get("relevance_score"),
                });
        }

        let rows = sqlx::query(
            r#"
            SELECT id, session_id, owner_id, role, content, model_name, created_at
            FROM chat_messages
            WHERE session_id = ? AND owner_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let role: String = row.get("role");
                Ok(ChatMessage {
                    references: references.remove(&id).unwrap_or_default(),
                    id,
                    session_id: row.get("session_id"),
                    owner_id: row.get("owner_id"),
                    role: parse_enum(&role)?,
                    content: row.get("content"),
                    model_name: row.get("model_name"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
