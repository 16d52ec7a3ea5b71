//! Document retrieval by ID for the `healthflow get` command.
//!
//! Reads straight from the database, so it works with embeddings
//! disabled.
//!
//! ```bash
//! healthflow get 550e8400-e29b-41d4-a716-446655440000 --owner user-alice
//! ```

use anyhow::{anyhow, Result};

use healthflow_core::models::{Chunk, Document};
use healthflow_core::store::{Store, VectorIndex};

use crate::config::Config;
use crate::db;
use crate::embedding::model_spec;
use crate::sqlite_store::SqliteStore;

/// A document with its chunks, as shown by `healthflow get`.
pub struct DocumentView {
    pub document: Document,
    pub chunks: Vec<Chunk>,
    /// Chunks with a vector under the configured model, when one is set.
    pub embedded: Option<usize>,
}

pub async fn get_document(config: &Config, owner_id: &str, id: &str) -> Result<DocumentView> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let document = store
        .get_document(owner_id, id)
        .await?
        .ok_or_else(|| anyhow!("document not found: {}", id))?;
    let chunks = store.list_chunks(owner_id, id).await?;
    let embedded = match model_spec(&config.embedding) {
        Ok(model) if config.embedding.is_enabled() => {
            Some(store.count_embedded(owner_id, id, &model.name).await?)
        }
        _ => None,
    };
    pool.close().await;

    Ok(DocumentView {
        document,
        chunks,
        embedded,
    })
}

/// CLI entry point for `healthflow get <id>`.
pub async fn run_get(config: &Config, owner_id: &str, id: &str) -> Result<()> {
    let view = get_document(config, owner_id, id).await?;
    let doc = &view.document;

    println!("--- Document ---");
    println!("id:            {}", doc.id);
    println!("file_name:     {}", doc.file_name);
    println!("type:          {}", doc.document_type);
    println!("mime_type:     {}", doc.mime_type);
    println!("size:          {} bytes", doc.file_size);
    println!("status:        {}", doc.processing_status);
    if let Some(ref error) = doc.processing_error {
        println!("error:         {}", error);
    }
    if let Some(date) = doc.document_date {
        println!("document_date: {}", date);
    }
    if !doc.tags.is_empty() {
        println!("tags:          {}", doc.tags.join(", "));
    }
    println!("uploaded_at:   {}", doc.uploaded_at);
    if let Some(processed_at) = doc.processed_at {
        println!("processed_at:  {}", processed_at);
    }
    if let Some(embedded) = view.embedded {
        println!("embedded:      {}/{}", embedded, view.chunks.len());
    }
    println!();

    println!("--- Chunks ({}) ---", view.chunks.len());
    for chunk in &view.chunks {
        println!("[chunk {}] {} chars", chunk.chunk_index, chunk.char_count);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}
