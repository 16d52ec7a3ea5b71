//! Owner-scoped semantic search over embedded chunks.
//!
//! The query is embedded through the same [`Embedder`] used at ingestion
//! time, the [`VectorIndex`] returns the nearest chunks above the
//! similarity threshold, and each hit is enriched with its document's
//! file name and type. Hits whose document disappeared between the index
//! query and enrichment are dropped.

use serde::Serialize;
use std::collections::HashMap;

use crate::embedding::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::models::{Document, DocumentType};
use crate::store::{Store, VectorIndex};

/// Longest snippet attached to a search hit, in characters.
pub const SNIPPET_CHARS: usize = 240;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub limit: usize,
    pub min_similarity: f32,
    /// Upper bound for `limit`.
    pub max_top_k: usize,
}

/// A search hit as returned to API and CLI callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub file_name: String,
    pub document_type: DocumentType,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub similarity: f32,
    pub snippet: String,
    /// Full chunk text, used as grounding context for chat.
    #[serde(skip)]
    pub text: String,
}

/// Run a semantic search for `owner_id`.
///
/// # Errors
///
/// - `Validation` for a blank query, a zero limit, or a threshold outside
///   `[-1, 1]`.
/// - Embedding errors from the query embedding.
pub async fn semantic_search(
    store: &dyn Store,
    index: &dyn VectorIndex,
    embedder: &Embedder,
    owner_id: &str,
    query: &str,
    params: SearchParams,
) -> CoreResult<Vec<SearchHit>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CoreError::Validation("query must not be empty".to_string()));
    }
    if params.limit == 0 {
        return Err(CoreError::Validation("limit must be at least 1".to_string()));
    }
    if !(-1.0..=1.0).contains(&params.min_similarity) {
        return Err(CoreError::Validation(format!(
            "threshold must be within [-1, 1], got {}",
            params.min_similarity
        )));
    }
    let top_k = params.limit.min(params.max_top_k.max(1));

    let query_vec = embedder.embed_query(query).await?;
    let scored = index
        .query(
            owner_id,
            &query_vec,
            embedder.model(),
            top_k,
            params.min_similarity,
        )
        .await?;

    let mut docs: HashMap<String, Option<Document>> = HashMap::new();
    let mut hits = Vec::with_capacity(scored.len());
    for s in scored {
        if !docs.contains_key(&s.document_id) {
            let doc = store.get_document(owner_id, &s.document_id).await?;
            docs.insert(s.document_id.clone(), doc);
        }
        let Some(Some(doc)) = docs.get(&s.document_id) else {
            continue;
        };
        hits.push(SearchHit {
            document_id: s.document_id,
            file_name: doc.file_name.clone(),
            document_type: doc.document_type,
            chunk_id: s.chunk_id,
            chunk_index: s.chunk_index,
            similarity: s.similarity,
            snippet: snippet(&s.text, SNIPPET_CHARS),
            text: s.text,
        });
    }
    Ok(hits)
}

/// Whitespace-collapsed prefix of `text`, at most `max_chars` characters
/// including a trailing ellipsis when truncated.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::models::{Chunk, ModelSpec, ProcessingStatus};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Maps texts mentioning "glucose" to one axis and everything else to
    /// the other.
    struct AxisProvider {
        model: ModelSpec,
    }

    #[async_trait]
    impl EmbeddingProvider for AxisProvider {
        fn model(&self) -> &ModelSpec {
            &self.model
        }

        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("glucose") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn embedder() -> Embedder {
        Embedder::new(
            Arc::new(AxisProvider {
                model: ModelSpec {
                    name: "axis".into(),
                    dims: 2,
                    max_input_tokens: 1000,
                },
            }),
            16,
        )
    }

    async fn seeded(embedder: &Embedder) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert_document(&Document {
                id: "d1".into(),
                owner_id: "alice".into(),
                file_name: "labs.pdf".into(),
                storage_path: "alice/labs.pdf".into(),
                mime_type: "application/pdf".into(),
                file_size: 1,
                document_type: DocumentType::LabReport,
                processing_status: ProcessingStatus::Completed,
                processing_error: None,
                extracted_text: None,
                metadata: serde_json::Map::new(),
                tags: vec![],
                document_date: None,
                uploaded_at: 1,
                processed_at: Some(1),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();
        let texts = ["fasting glucose 92 mg/dL", "blood pressure 120/80"];
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: format!("c{}", i),
                document_id: "d1".into(),
                owner_id: "alice".into(),
                chunk_index: i as i64,
                text: t.to_string(),
                char_count: t.chars().count() as i64,
                hash: crate::chunk::content_hash(t),
                created_at: 1,
            })
            .collect();
        store.replace_chunks("alice", "d1", &chunks).await.unwrap();
        for c in &chunks {
            let v = embedder.embed_query(&c.text).await.unwrap();
            store
                .upsert("alice", &c.id, &v, embedder.model())
                .await
                .unwrap();
        }
        store
    }

    fn params(limit: usize) -> SearchParams {
        SearchParams {
            limit,
            min_similarity: 0.7,
            max_top_k: 50,
        }
    }

    #[tokio::test]
    async fn finds_relevant_chunk_with_document_context() {
        let embedder = embedder();
        let store = seeded(&embedder).await;
        let hits = semantic_search(&store, &store, &embedder, "alice", "glucose?", params(10))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c0");
        assert_eq!(hits[0].file_name, "labs.pdf");
        assert_eq!(hits[0].document_type, DocumentType::LabReport);
    }

    #[tokio::test]
    async fn other_owner_sees_nothing() {
        let embedder = embedder();
        let store = seeded(&embedder).await;
        let hits = semantic_search(&store, &store, &embedder, "bob", "glucose", params(10))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn rejects_blank_query_and_zero_limit() {
        let embedder = embedder();
        let store = seeded(&embedder).await;
        let err = semantic_search(&store, &store, &embedder, "alice", "   ", params(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let err = semantic_search(&store, &store, &embedder, "alice", "glucose", params(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn snippet_is_bounded() {
        let long = "word ".repeat(200);
        let s = snippet(&long, SNIPPET_CHARS);
        assert_eq!(s.chars().count(), SNIPPET_CHARS);
        assert!(s.ends_with('…'));
        assert_eq!(snippet("  a\n\nb  ", 10), "a b");
    }
}
