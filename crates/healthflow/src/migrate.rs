//! Database schema migrations.
//!
//! Every statement is idempotent (`CREATE … IF NOT EXISTS`), so
//! `healthflow init` can be run any number of times.
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | Uploaded documents and their processing state |
//! | `chunks` | Overlapping text segments, unique per `(document_id, chunk_index)` |
//! | `embeddings` | One vector per `(chunk_id, model)` |
//! | `embedding_retries` | Chunks whose embedding failed, awaiting retry |
//! | `medical_entities` | Structured facts with a nullable document reference |
//! | `timeline_events` | Dated health events with a nullable document reference |
//! | `chat_sessions` / `chat_messages` | Conversation history |
//! | `message_references` | Message → document or entity links |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        file_name TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        document_type TEXT NOT NULL,
        processing_status TEXT NOT NULL DEFAULT 'pending',
        processing_error TEXT,
        extracted_text TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        tags_json TEXT NOT NULL DEFAULT '[]',
        document_date TEXT,
        uploaded_at INTEGER NOT NULL,
        processed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        char_count INTEGER NOT NULL,
        hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(document_id, chunk_index),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        chunk_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (chunk_id, model),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_retries (
        chunk_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        model TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (chunk_id, model),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS medical_entities (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        document_id TEXT,
        entity_type TEXT NOT NULL,
        entity_data_json TEXT NOT NULL,
        entity_date TEXT,
        extraction_confidence REAL,
        is_verified INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeline_events (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        document_id TEXT,
        event_type TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        event_date TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_sessions (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT,
        started_at INTEGER NOT NULL,
        last_message_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        session_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        model_name TEXT,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_references (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL,
        document_id TEXT,
        medical_entity_id TEXT,
        relevance_score REAL,
        CHECK ((document_id IS NOT NULL) + (medical_entity_id IS NOT NULL) = 1),
        FOREIGN KEY (message_id) REFERENCES chat_messages(id) ON DELETE CASCADE,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
        FOREIGN KEY (medical_entity_id) REFERENCES medical_entities(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id, uploaded_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_owner ON chunks(owner_id)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_owner_model ON embeddings(owner_id, model)",
    "CREATE INDEX IF NOT EXISTS idx_retries_document ON embedding_retries(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_entities_owner ON medical_entities(owner_id, entity_type)",
    "CREATE INDEX IF NOT EXISTS idx_events_owner ON timeline_events(owner_id, event_date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_owner ON chat_sessions(owner_id, last_message_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_references_message ON message_references(message_id)",
];

/// Connect to the configured database and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
