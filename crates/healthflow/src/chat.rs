//! Grounded chat over the owner's documents.
//!
//! [`ChatService::send`] stores the user's message, retrieves the closest
//! chunks through [`semantic_search`], asks an [`AnswerGenerator`] for a
//! reply and stores it with one reference per source document. Two
//! generators ship:
//!
//! - **[`OpenAIChat`]**: `POST {url}/chat/completions`.
//! - **[`ExtractiveAnswer`]**: no model; quotes the retrieved passages.
//!   Used when `[chat] provider = "disabled"`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use healthflow_core::embedding::Embedder;
use healthflow_core::error::{CoreError, CoreResult};
use healthflow_core::models::{
    ChatMessage, ChatSession, MessageReference, MessageRole, ReferenceTarget,
};
use healthflow_core::search::{semantic_search, snippet, SearchHit, SearchParams};
use healthflow_core::store::{ChatStore, Store, VectorIndex};

use crate::config::ChatConfig;
use crate::embedding::post_json;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const MAX_MESSAGE_CHARS: usize = 4000;
const TITLE_CHARS: usize = 60;
/// Prior messages replayed to the model.
const HISTORY_MESSAGES: usize = 10;

const SYSTEM_PROMPT: &str = "You answer questions about the user's own health records. \
Use only the numbered passages below. Cite passages as [n]. \
If the passages do not contain the answer, say so. Do not give medical advice.";

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Recorded as the assistant message's `model_name`.
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        question: &str,
        history: &[ChatMessage],
        context: &[SearchHit],
    ) -> CoreResult<String>;
}

pub fn create_generator(config: &ChatConfig) -> Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "disabled" => Ok(Arc::new(ExtractiveAnswer)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

fn numbered_context(context: &[SearchHit]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] ({}) {}", i + 1, hit.file_name, hit.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============ OpenAI ============

pub struct OpenAIChat {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            max_tokens: config.max_tokens,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }

    fn request_body(
        &self,
        question: &str,
        history: &[ChatMessage],
        context: &[SearchHit],
    ) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": format!("{}\n\nPassages:\n\n{}", SYSTEM_PROMPT, numbered_context(context)),
        })];
        for message in history {
            messages.push(serde_json::json!({
                "role": message.role.as_str(),
                "content": message.content,
            }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": question }));

        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "messages": messages,
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        question: &str,
        history: &[ChatMessage],
        context: &[SearchHit],
    ) -> CoreResult<String> {
        let body = self.request_body(question, history, context);
        let json = post_json(
            &self.client,
            "OpenAI",
            &format!("{}/chat/completions", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
        )
        .await?;
        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> CoreResult<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| CoreError::permanent("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Extractive ============

/// Answers by quoting the retrieved passages.
pub struct ExtractiveAnswer;

#[async_trait]
impl AnswerGenerator for ExtractiveAnswer {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn generate(
        &self,
        _question: &str,
        _history: &[ChatMessage],
        context: &[SearchHit],
    ) -> CoreResult<String> {
        if context.is_empty() {
            return Ok("I could not find anything in your documents about that.".to_string());
        }
        let passages: Vec<String> = context
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[{}] {}: {}", i + 1, hit.file_name, hit.snippet))
            .collect();
        Ok(format!(
            "Here is what your documents say:\n\n{}",
            passages.join("\n")
        ))
    }
}

// ============ Service ============

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session: ChatSession,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub sources: Vec<SearchHit>,
}

pub struct ChatService {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    chats: Arc<dyn ChatStore>,
    embedder: Arc<Embedder>,
    generator: Arc<dyn AnswerGenerator>,
    retrieval: SearchParams,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        chats: Arc<dyn ChatStore>,
        embedder: Arc<Embedder>,
        generator: Arc<dyn AnswerGenerator>,
        retrieval: SearchParams,
    ) -> Self {
        Self {
            store,
            index,
            chats,
            embedder,
            generator,
            retrieval,
        }
    }

    pub async fn create_session(
        &self,
        owner_id: &str,
        title: Option<&str>,
    ) -> CoreResult<ChatSession> {
        let now = chrono::Utc::now().timestamp();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| snippet(t, TITLE_CHARS)),
            started_at: now,
            last_message_at: now,
        };
        self.chats.create_session(&session).await?;
        Ok(session)
    }

    pub async fn list_sessions(&self, owner_id: &str) -> CoreResult<Vec<ChatSession>> {
        self.chats.list_sessions(owner_id).await
    }

    pub async fn messages(&self, owner_id: &str, session_id: &str) -> CoreResult<Vec<ChatMessage>> {
        self.chats.list_messages(owner_id, session_id).await
    }

    /// Answer `message` in `session_id`, or in a new session titled after
    /// the message.
    pub async fn send(
        &self,
        owner_id: &str,
        session_id: Option<&str>,
        message: &str,
    ) -> CoreResult<ChatReply> {
        let question = message.trim();
        if question.is_empty() {
            return Err(CoreError::Validation("message must not be empty".to_string()));
        }
        if question.chars().count() > MAX_MESSAGE_CHARS {
            return Err(CoreError::Validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let session = match session_id {
            Some(id) => self
                .chats
                .get_session(owner_id, id)
                .await?
                .ok_or_else(|| CoreError::not_found("chat session"))?,
            None => self.create_session(owner_id, Some(question)).await?,
        };

        let prior = self.chats.list_messages(owner_id, &session.id).await?;
        let history = &prior[prior.len().saturating_sub(HISTORY_MESSAGES)..];

        let user_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            owner_id: owner_id.to_string(),
            role: MessageRole::User,
            content: question.to_string(),
            model_name: None,
            created_at: chrono::Utc::now().timestamp(),
            references: Vec::new(),
        };
        self.chats.append_message(&user_message).await?;

        let sources = semantic_search(
            self.store.as_ref(),
            self.index.as_ref(),
            &self.embedder,
            owner_id,
            question,
            self.retrieval,
        )
        .await?;
        tracing::debug!(session_id = %session.id, sources = sources.len(), "chat context retrieved");

        let answer = self.generator.generate(question, history, &sources).await?;

        let assistant_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            owner_id: owner_id.to_string(),
            role: MessageRole::Assistant,
            content: answer,
            model_name: Some(self.generator.model_name().to_string()),
            created_at: chrono::Utc::now().timestamp(),
            references: document_references(&sources),
        };
        self.chats.append_message(&assistant_message).await?;
        tracing::info!(
            session_id = %session.id,
            references = assistant_message.references.len(),
            "chat answer stored"
        );

        let session = self
            .chats
            .get_session(owner_id, &session.id)
            .await?
            .unwrap_or(session);
        Ok(ChatReply {
            session,
            user_message,
            assistant_message,
            sources,
        })
    }
}

/// One reference per source document, scored by its best hit. `hits` is
/// sorted by similarity, so the first hit per document is its best.
fn document_references(hits: &[SearchHit]) -> Vec<MessageReference> {
    let mut references: Vec<MessageReference> = Vec::new();
    for hit in hits {
        let target = ReferenceTarget::Document(hit.document_id.clone());
        if references.iter().all(|r| r.target != target) {
            references.push(MessageReference {
                target,
                relevance_score: Some(hit.similarity),
            });
        }
    }
    references
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthflow_core::chunk::ChunkParams;
    use healthflow_core::models::DocumentType;
    use healthflow_core::store::memory::InMemoryStore;

    use crate::ingest::{IngestionPipeline, PipelineSettings};
    use crate::storage::BlobStorage;
    use crate::testing::{pending_document, MemoryBlobs, ScriptedProvider, Utf8Extractor};

    fn hit(document_id: &str, chunk_id: &str, similarity: f32) -> SearchHit {
        SearchHit {
            document_id: document_id.into(),
            file_name: format!("{}.txt", document_id),
            document_type: DocumentType::LabReport,
            chunk_id: chunk_id.into(),
            chunk_index: 0,
            similarity,
            snippet: "Glucose 95 mg/dL".into(),
            text: "Glucose 95 mg/dL fasting".into(),
        }
    }

    async fn service_with_documents(texts: &[&str]) -> (Arc<InMemoryStore>, ChatService) {
        let store = Arc::new(InMemoryStore::new());
        let blobs = Arc::new(MemoryBlobs::default());
        let embedder = Arc::new(Embedder::new(Arc::new(ScriptedProvider::new(0)), 100));
        let pipeline = IngestionPipeline::new(
            store.clone(),
            store.clone(),
            blobs.clone(),
            Arc::new(Utf8Extractor),
            embedder.clone(),
            PipelineSettings {
                chunking: ChunkParams::new(500, 50).unwrap(),
                batch_size: 8,
                concurrency: 1,
                max_retries: 0,
                backoff_base_ms: 1,
            },
        );
        for (i, text) in texts.iter().enumerate() {
            let id = format!("doc-{}", i);
            let path = blobs
                .put("alice", "note.txt", text.as_bytes(), "text/plain")
                .await
                .unwrap();
            store
                .insert_document(&pending_document(&id, "alice", &path, "text/plain", text.len()))
                .await
                .unwrap();
            pipeline.run("alice", &id, false).await.unwrap();
        }
        let service = ChatService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            embedder,
            Arc::new(ExtractiveAnswer),
            SearchParams {
                limit: 5,
                min_similarity: 0.5,
                max_top_k: 50,
            },
        );
        (store, service)
    }

    #[tokio::test]
    async fn send_creates_titled_session_and_cites_documents() {
        let (_store, chat) = service_with_documents(&["Glucose 95 mg/dL fasting"]).await;

        let reply = chat
            .send("alice", None, "What was my fasting glucose?")
            .await
            .unwrap();
        assert_eq!(reply.session.title.as_deref(), Some("What was my fasting glucose?"));
        assert_eq!(reply.user_message.role, MessageRole::User);
        assert_eq!(reply.assistant_message.role, MessageRole::Assistant);
        assert_eq!(reply.assistant_message.model_name.as_deref(), Some("extractive"));
        assert!(reply.assistant_message.content.contains("note.txt"));
        assert_eq!(
            reply.assistant_message.references[0].target,
            ReferenceTarget::Document("doc-0".into())
        );

        let messages = chat.messages("alice", &reply.session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, reply.user_message.id);
        assert_eq!(messages[1].references.len(), 1);
    }

    #[tokio::test]
    async fn follow_up_goes_to_same_session() {
        let (_store, chat) = service_with_documents(&["Blood pressure 118/76"]).await;
        let first = chat.send("alice", None, "blood pressure?").await.unwrap();
        let second = chat
            .send("alice", Some(&first.session.id), "and last year?")
            .await
            .unwrap();
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(chat.messages("alice", &first.session.id).await.unwrap().len(), 4);
        assert_eq!(chat.list_sessions("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_or_missing_session_is_not_found() {
        let (_store, chat) = service_with_documents(&["Ferritin 40 ng/mL"]).await;
        let mine = chat.create_session("alice", Some("iron")).await.unwrap();
        assert!(matches!(
            chat.send("bob", Some(&mine.id), "iron?").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            chat.send("alice", Some("nope"), "iron?").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            chat.messages("bob", &mine.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn blank_message_rejected() {
        let (_store, chat) = service_with_documents(&[]).await;
        assert!(matches!(
            chat.send("alice", None, "   ").await,
            Err(CoreError::Validation(_))
        ));
        assert!(chat.list_sessions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_sources_yields_no_references() {
        let (_store, chat) = service_with_documents(&["Vitamin D 30 ng/mL"]).await;
        let reply = chat.send("bob", None, "vitamin D?").await.unwrap();
        assert!(reply.sources.is_empty());
        assert!(reply.assistant_message.references.is_empty());
        assert!(reply.assistant_message.content.contains("could not find"));
    }

    #[test]
    fn references_keep_best_score_per_document() {
        let hits = vec![hit("a", "c1", 0.9), hit("b", "c2", 0.8), hit("a", "c3", 0.7)];
        let refs = document_references(&hits);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].target, ReferenceTarget::Document("a".into()));
        assert_eq!(refs[0].relevance_score, Some(0.9));
        assert_eq!(refs[1].relevance_score, Some(0.8));
    }

    #[test]
    fn completion_parsing() {
        let json = serde_json::json!({"choices": [{"message": {"content": " Your A1c was 5.6% [1]. "}}]});
        assert_eq!(parse_completion(&json).unwrap(), "Your A1c was 5.6% [1].");
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn context_is_numbered() {
        let text = numbered_context(&[hit("a", "c1", 0.9), hit("b", "c2", 0.8)]);
        assert!(text.starts_with("[1] (a.txt) Glucose"));
        assert!(text.contains("\n\n[2] (b.txt)"));
    }
}
