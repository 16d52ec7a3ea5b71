//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/v1/auth/login` | Exchange credentials for tokens |
//! | `POST` | `/api/v1/auth/refresh` | Exchange a refresh token for new tokens |
//! | `POST` | `/api/v1/documents` | Multipart upload (`file`), `?document_type=` |
//! | `GET`  | `/api/v1/documents` | List documents, `?document_type=` |
//! | `GET` `PATCH` `DELETE` | `/api/v1/documents/{id}` | Read, annotate, delete |
//! | `GET`  | `/api/v1/documents/{id}/chunks` | Chunks in order |
//! | `POST` | `/api/v1/documents/{id}/reprocess` | Re-run ingestion, `?force=` |
//! | `GET`  | `/api/v1/search/semantic` | `?q=&limit=&threshold=` |
//! | `GET`  | `/api/v1/search/documents` | Keyword match on name and text, `?q=&limit=` |
//! | `GET`  | `/api/v1/search/entities` | Keyword match on entity data, `?q=&limit=` |
//! | `POST` | `/api/v1/entities` | Record a medical entity |
//! | `GET` `DELETE` | `/api/v1/entities/{id}` | Read, delete |
//! | `POST` | `/api/v1/timeline` | Record a timeline event |
//! | `GET` `DELETE` | `/api/v1/timeline/{id}` | Read, delete |
//! | `POST` | `/api/v1/chat` | Ask a question |
//! | `GET` `POST` | `/api/v1/chat/sessions` | List or create sessions |
//! | `GET`  | `/api/v1/chat/sessions/{id}/messages` | Session transcript |
//!
//! Everything under `/api/v1` except the auth routes requires
//! `Authorization: Bearer <access token>`; the token's subject is the
//! owner for every data access.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found" } }
//! ```
//!
//! | Error | Status |
//! |-------|--------|
//! | `Auth` | 401 |
//! | `Validation`, `InvalidInput` | 400 (oversized upload: 413) |
//! | `NotFound` | 404 |
//! | `Cancelled` | 409 |
//! | `DimensionMismatch`, `Extraction` | 422 |
//! | `ExternalService` | 503 |
//! | `Storage` | 500 |
//!
//! Uploads return `202 Accepted` once the document is stored; ingestion
//! continues in a background task.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, Request, State,
    },
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use healthflow_core::error::CoreError;
use healthflow_core::models::{
    ChatMessage, ChatSession, Chunk, Document, DocumentType, MedicalEntity, TimelineEvent,
};
use healthflow_core::search::SearchHit;
use healthflow_core::store::Annotations;

use crate::chat::ChatReply;
use crate::config::Config;
use crate::documents::Upload;
use crate::identity::{Credentials, HmacIdentity, IdentityProvider, Session};
use crate::ingest::IngestOutcome;
use crate::records::{NewEntity, NewEvent};
use crate::services::Services;

/// Multipart framing allowance on top of `storage.max_upload_bytes`.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Authenticated subject, inserted by the auth middleware.
#[derive(Debug, Clone)]
struct Owner(String);

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let identity = HmacIdentity::from_config(&config.auth)?;
    let state = AppState {
        services: Arc::new(services),
        identity: Arc::new(identity),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the full router with auth, CORS and body limits applied.
pub fn build_router(state: AppState) -> Router {
    let config = state.services.config.clone();
    let upload_limit = usize::try_from(config.storage.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let protected = Router::new()
        .route(
            "/documents",
            post(handle_upload)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(handle_list_documents),
        )
        .route(
            "/documents/{id}",
            get(handle_get_document)
                .patch(handle_update_document)
                .delete(handle_delete_document),
        )
        .route("/documents/{id}/chunks", get(handle_list_chunks))
        .route("/documents/{id}/reprocess", post(handle_reprocess))
        .route("/search/semantic", get(handle_search))
        .route("/search/documents", get(handle_search_documents))
        .route("/search/entities", get(handle_search_entities))
        .route("/entities", post(handle_create_entity))
        .route(
            "/entities/{id}",
            get(handle_get_entity).delete(handle_delete_entity),
        )
        .route("/timeline", post(handle_create_event))
        .route(
            "/timeline/{id}",
            get(handle_get_event).delete(handle_delete_event),
        )
        .route("/chat", post(handle_chat))
        .route(
            "/chat/sessions",
            get(handle_list_sessions).post(handle_create_session),
        )
        .route("/chat/sessions/{id}/messages", get(handle_list_messages))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api = Router::new()
        .route("/auth/login", post(handle_login))
        .route("/auth/refresh", post(handle_refresh))
        .merge(protected);

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/v1", api)
        .layer(cors_layer(&config.server.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "payload_too_large".to_string(),
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }

    /// Keep the extractor's status but answer in the JSON error envelope.
    fn rejected(status: StatusCode, message: String) -> Self {
        let code = match status {
            StatusCode::UNSUPPORTED_MEDIA_TYPE => "unsupported_media_type",
            StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
            StatusCode::UNPROCESSABLE_ENTITY => "invalid_input",
            _ => "bad_request",
        };
        Self {
            status,
            code: code.to_string(),
            message,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoreError::Validation(_) | CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Cancelled(_) => StatusCode::CONFLICT,
            CoreError::DimensionMismatch { .. } | CoreError::Extraction(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::ExternalService { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &e {
            CoreError::Storage(inner) => {
                tracing::error!(error = %inner, "storage failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status,
            code: e.code().to_string(),
            message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Auth ============

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .ok_or_else(|| CoreError::Auth("missing bearer token".to_string()))?;
    let subject = state.identity.verify(&token).await?;
    request.extensions_mut().insert(Owner(subject));
    Ok(next.run(request).await)
}

async fn handle_login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<Session>, AppError> {
    let Json(credentials) = payload?;
    Ok(Json(state.identity.authenticate(&credentials).await?))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn handle_refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<Session>, AppError> {
    let Json(body) = payload?;
    Ok(Json(state.identity.refresh(&body.refresh_token).await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Documents ============

#[derive(Deserialize)]
struct DocumentTypeQuery {
    document_type: Option<DocumentType>,
}

/// Handler for `POST /api/v1/documents`.
///
/// Reads the `file` part, stores it and starts ingestion in the
/// background. Returns `202` with the `pending` document.
async fn handle_upload(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    query: Result<Query<DocumentTypeQuery>, QueryRejection>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let Query(query) = query?;
    let documents = &state.services.documents;
    let mut upload = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("document").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        if documents.limits().is_oversized(bytes.len()) {
            return Err(AppError::payload_too_large(format!(
                "file exceeds {} bytes",
                documents.limits().max_upload_bytes
            )));
        }
        upload = Some(Upload {
            file_name,
            mime_type,
            document_type: query.document_type.unwrap_or(DocumentType::Other),
            bytes: bytes.to_vec(),
        });
        break;
    }

    let upload = upload.ok_or_else(|| AppError::bad_request("multipart field 'file' is required"))?;
    let doc = documents.upload(&owner, upload).await?;
    state
        .services
        .pipeline
        .spawn(owner, doc.id.clone(), false);
    Ok((StatusCode::ACCEPTED, Json(doc)))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large(e.body_text())
    } else {
        AppError::bad_request(e.body_text())
    }
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    query: Result<Query<DocumentTypeQuery>, QueryRejection>,
) -> Result<Json<Vec<Document>>, AppError> {
    let Query(query) = query?;
    Ok(Json(
        state
            .services
            .documents
            .list(&owner, query.document_type)
            .await?,
    ))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(state.services.documents.get(&owner, &id).await?))
}

#[derive(Deserialize)]
struct AnnotationsRequest {
    tags: Option<Vec<String>>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
    document_date: Option<chrono::NaiveDate>,
}

async fn handle_update_document(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    payload: Result<Json<AnnotationsRequest>, JsonRejection>,
) -> Result<Json<Document>, AppError> {
    let Json(body) = payload?;
    let annotations = Annotations {
        tags: body.tags,
        metadata: body.metadata,
        document_date: body.document_date,
    };
    Ok(Json(
        state
            .services
            .documents
            .update_annotations(&owner, &id, &annotations)
            .await?,
    ))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.services.documents.delete(&owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_chunks(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Chunk>>, AppError> {
    Ok(Json(state.services.documents.chunks(&owner, &id).await?))
}

#[derive(Deserialize)]
struct ReprocessQuery {
    #[serde(default)]
    force: bool,
}

/// Handler for `POST /api/v1/documents/{id}/reprocess`. Runs to completion.
async fn handle_reprocess(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    query: Result<Query<ReprocessQuery>, QueryRejection>,
) -> Result<Json<IngestOutcome>, AppError> {
    let Query(query) = query?;
    Ok(Json(
        state
            .services
            .documents
            .reprocess(&owner, &id, query.force)
            .await?,
    ))
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<usize>,
    threshold: Option<f32>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Query(query) = query?;
    let results = state
        .services
        .search(&owner, &query.q, query.limit, query.threshold)
        .await?;
    Ok(Json(SearchResponse {
        query: query.q,
        results,
    }))
}

#[derive(Deserialize)]
struct KeywordQuery {
    q: String,
    limit: Option<usize>,
}

async fn handle_search_documents(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    query: Result<Query<KeywordQuery>, QueryRejection>,
) -> Result<Json<Vec<Document>>, AppError> {
    let Query(query) = query?;
    Ok(Json(
        state
            .services
            .records
            .search_documents(&owner, &query.q, query.limit)
            .await?,
    ))
}

async fn handle_search_entities(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    query: Result<Query<KeywordQuery>, QueryRejection>,
) -> Result<Json<Vec<MedicalEntity>>, AppError> {
    let Query(query) = query?;
    Ok(Json(
        state
            .services
            .records
            .search_entities(&owner, &query.q, query.limit)
            .await?,
    ))
}

// ============ Entities & timeline ============

async fn handle_create_entity(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    payload: Result<Json<NewEntity>, JsonRejection>,
) -> Result<(StatusCode, Json<MedicalEntity>), AppError> {
    let Json(body) = payload?;
    let entity = state.services.records.create_entity(&owner, body).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn handle_get_entity(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<MedicalEntity>, AppError> {
    Ok(Json(state.services.records.get_entity(&owner, &id).await?))
}

async fn handle_delete_entity(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.services.records.delete_entity(&owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_create_event(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    payload: Result<Json<NewEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<TimelineEvent>), AppError> {
    let Json(body) = payload?;
    let event = state.services.records.create_event(&owner, body).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn handle_get_event(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<TimelineEvent>, AppError> {
    Ok(Json(state.services.records.get_event(&owner, &id).await?))
}

async fn handle_delete_event(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.services.records.delete_event(&owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    session_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let Json(body) = payload?;
    Ok(Json(
        state
            .services
            .chat
            .send(&owner, body.session_id.as_deref(), &body.message)
            .await?,
    ))
}

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
    title: Option<String>,
}

async fn handle_create_session(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    payload: Result<Option<Json<CreateSessionRequest>>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatSession>), AppError> {
    let body = payload?.map(|Json(body)| body).unwrap_or_default();
    let session = state
        .services
        .chat
        .create_session(&owner, body.title.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_list_sessions(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> Result<Json<Vec<ChatSession>>, AppError> {
    Ok(Json(state.services.chat.list_sessions(&owner).await?))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    Ok(Json(state.services.chat.messages(&owner, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use healthflow_core::store::memory::InMemoryStore;
    use healthflow_core::store::Store;
    use tower::ServiceExt;

    use crate::chat::ExtractiveAnswer;
    use crate::config::{parse_config, AuthConfig, UserConfig};
    use crate::identity::hash_password;
    use crate::testing::{MemoryBlobs, ScriptedProvider, Utf8Extractor};

    const BOUNDARY: &str = "healthflow-test-boundary";

    struct TestApp {
        router: Router,
        services: Arc<Services>,
        identity: Arc<HmacIdentity>,
    }

    fn test_app() -> TestApp {
        let config = parse_config(
            r#"
[db]
path = ":memory:"

[storage]
max_upload_bytes = 256
allowed_mime_types = ["text/plain"]

[retrieval]
min_similarity = 0.5
"#,
        )
        .unwrap();
        let services = Services::assemble(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryBlobs::default()),
            Arc::new(Utf8Extractor),
            Arc::new(ScriptedProvider::new(0)),
            Arc::new(ExtractiveAnswer),
        )
        .unwrap();
        let hashed = hash_password("s3cret", 1_000);
        let auth = AuthConfig {
            users: vec![UserConfig {
                username: "alice".into(),
                subject: "user-alice".into(),
                password_salt: hashed.salt,
                password_hash: hashed.hash,
                pbkdf2_iterations: hashed.iterations,
            }],
            ..AuthConfig::default()
        };
        let identity = Arc::new(HmacIdentity::new(b"server-test-key-0123456789".to_vec(), &auth).unwrap());
        let services = Arc::new(services);
        let router = build_router(AppState {
            services: services.clone(),
            identity: identity.clone(),
        });
        TestApp {
            router,
            services,
            identity,
        }
    }

    impl TestApp {
        fn bearer(&self, subject: &str) -> String {
            format!("Bearer {}", self.identity.issue_access_token(subject).unwrap())
        }

        async fn send(&self, request: HttpRequest<Body>) -> (StatusCode, serde_json::Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }

        async fn get(&self, uri: &str, subject: &str) -> (StatusCode, serde_json::Value) {
            let request = HttpRequest::get(uri)
                .header(header::AUTHORIZATION, self.bearer(subject))
                .body(Body::empty())
                .unwrap();
            self.send(request).await
        }

        async fn post_json(
            &self,
            uri: &str,
            subject: Option<&str>,
            body: serde_json::Value,
        ) -> (StatusCode, serde_json::Value) {
            let mut request = HttpRequest::post(uri).header(header::CONTENT_TYPE, "application/json");
            if let Some(subject) = subject {
                request = request.header(header::AUTHORIZATION, self.bearer(subject));
            }
            self.send(request.body(Body::from(body.to_string())).unwrap())
                .await
        }

        async fn upload(&self, subject: &str, name: &str, mime: &str, content: &str) -> (StatusCode, serde_json::Value) {
            let body = format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: {mime}\r\n\r\n{content}\r\n--{b}--\r\n",
                b = BOUNDARY,
                name = name,
                mime = mime,
                content = content
            );
            let request = HttpRequest::post("/api/v1/documents?document_type=lab_report")
                .header(header::AUTHORIZATION, self.bearer(subject))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(body))
                .unwrap();
            self.send(request).await
        }

        /// Store and ingest a document without going through HTTP.
        async fn ingested(&self, owner: &str, text: &str) -> String {
            let doc = self
                .services
                .documents
                .upload(
                    owner,
                    Upload {
                        file_name: "labs.txt".into(),
                        mime_type: "text/plain".into(),
                        document_type: DocumentType::LabReport,
                        bytes: text.as_bytes().to_vec(),
                    },
                )
                .await
                .unwrap();
            self.services.pipeline.run(owner, &doc.id, false).await.unwrap();
            doc.id
        }
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = test_app();
        let request = HttpRequest::get("/health").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let app = test_app();
        let request = HttpRequest::get("/api/v1/documents").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let request = HttpRequest::get("/api/v1/documents")
            .header(header::AUTHORIZATION, "Bearer forged.token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.send(request).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_then_use_access_token() {
        let app = test_app();
        let (status, _) = app
            .post_json(
                "/api/v1/auth/login",
                None,
                serde_json::json!({"username": "alice", "password": "wrong"}),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, session) = app
            .post_json(
                "/api/v1/auth/login",
                None,
                serde_json::json!({"username": "alice", "password": "s3cret"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["subject"], "user-alice");

        let token = session["access_token"].as_str().unwrap();
        let request = HttpRequest::get("/api/v1/documents")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, docs) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(docs, serde_json::json!([]));

        let (status, renewed) = app
            .post_json(
                "/api/v1/auth/refresh",
                None,
                serde_json::json!({"refresh_token": session["refresh_token"]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(renewed["access_token"].is_string());
    }

    #[tokio::test]
    async fn malformed_requests_use_error_envelope() {
        let app = test_app();
        let request = HttpRequest::post("/api/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
        assert!(body["error"]["message"].is_string());

        let (status, body) = app
            .post_json(
                "/api/v1/auth/login",
                None,
                serde_json::json!({"username": "alice"}),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "invalid_input");

        let request = HttpRequest::post("/api/v1/auth/refresh")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["error"]["code"], "unsupported_media_type");

        let (status, body) = app
            .get("/api/v1/documents?document_type=horoscope", "user-alice")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn upload_is_accepted_and_ingested_in_background() {
        let app = test_app();
        let (status, doc) = app
            .upload("user-alice", "cbc.txt", "text/plain", "Hemoglobin 13.5 g/dL")
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(doc["document_type"], "lab_report");
        let id = doc["id"].as_str().unwrap().to_string();

        let mut settled = None;
        for _ in 0..100 {
            let (_, doc) = app.get(&format!("/api/v1/documents/{}", id), "user-alice").await;
            if doc["processing_status"] == "completed" {
                settled = Some(doc);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(settled.is_some(), "document never completed");

        let (status, chunks) = app
            .get(&format!("/api/v1/documents/{}/chunks", id), "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chunks[0]["text"], "Hemoglobin 13.5 g/dL");
    }

    #[tokio::test]
    async fn upload_limits_map_to_status_codes() {
        let app = test_app();
        let (status, body) = app
            .upload("user-alice", "note.mp3", "audio/mpeg", "ID3")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let (status, body) = app
            .upload("user-alice", "big.txt", "text/plain", &"x".repeat(300))
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"]["code"], "payload_too_large");

        let (_, docs) = app.get("/api/v1/documents", "user-alice").await;
        assert_eq!(docs, serde_json::json!([]));
    }

    #[tokio::test]
    async fn documents_are_owner_scoped() {
        let app = test_app();
        let id = app.ingested("user-alice", "Potassium 4.2 mmol/L").await;

        let (status, body) = app.get(&format!("/api/v1/documents/{}", id), "user-bob").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (_, results) = app
            .get("/api/v1/search/semantic?q=Potassium%204.2%20mmol%2FL", "user-bob")
            .await;
        assert_eq!(results["results"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn search_returns_enriched_hits() {
        let app = test_app();
        let id = app.ingested("user-alice", "Potassium 4.2 mmol/L").await;

        let (status, body) = app
            .get("/api/v1/search/semantic?q=Potassium%204.2%20mmol%2FL&limit=3", "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        let hit = &body["results"][0];
        assert_eq!(hit["document_id"], id.as_str());
        assert_eq!(hit["file_name"], "labs.txt");
        assert_eq!(hit["document_type"], "lab_report");
        assert!(hit.get("text").is_none());

        let (status, body) = app.get("/api/v1/search/semantic?q=%20", "user-alice").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn annotate_reprocess_and_delete() {
        let app = test_app();
        let id = app.ingested("user-alice", "Sodium 140 mmol/L").await;

        let request = HttpRequest::patch(format!("/api/v1/documents/{}", id))
            .header(header::AUTHORIZATION, app.bearer("user-alice"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"tags": ["electrolytes"], "document_date": "2024-03-01"}"#,
            ))
            .unwrap();
        let (status, doc) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["tags"], serde_json::json!(["electrolytes"]));
        assert_eq!(doc["document_date"], "2024-03-01");

        let (status, outcome) = app
            .post_json(
                &format!("/api/v1/documents/{}/reprocess", id),
                Some("user-alice"),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["skipped"], true);

        let (status, outcome) = app
            .post_json(
                &format!("/api/v1/documents/{}/reprocess?force=true", id),
                Some("user-alice"),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["skipped"], false);

        let request = HttpRequest::delete(format!("/api/v1/documents/{}", id))
            .header(header::AUTHORIZATION, app.bearer("user-alice"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.send(request).await.0, StatusCode::NO_CONTENT);
        let (status, _) = app.get(&format!("/api/v1/documents/{}", id), "user-alice").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(app
            .services
            .store
            .get_document("user-alice", &id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn chat_round_trip() {
        let app = test_app();
        let id = app.ingested("user-alice", "LDL cholesterol 130 mg/dL").await;

        let (status, reply) = app
            .post_json(
                "/api/v1/chat",
                Some("user-alice"),
                serde_json::json!({"message": "LDL cholesterol?"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = reply["session"]["id"].as_str().unwrap().to_string();
        assert_eq!(
            reply["assistant_message"]["references"][0]["target"],
            serde_json::json!({"kind": "document", "id": id})
        );

        let (status, sessions) = app.get("/api/v1/chat/sessions", "user-alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sessions.as_array().unwrap().len(), 1);

        let (status, messages) = app
            .get(&format!("/api/v1/chat/sessions/{}/messages", session_id), "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");

        let (status, _) = app
            .get(&format!("/api/v1/chat/sessions/{}/messages", session_id), "user-bob")
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_session_with_and_without_body() {
        let app = test_app();
        let (status, session) = app
            .post_json(
                "/api/v1/chat/sessions",
                Some("user-alice"),
                serde_json::json!({"title": "Cardiology"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(session["title"], "Cardiology");

        let request = HttpRequest::post("/api/v1/chat/sessions")
            .header(header::AUTHORIZATION, app.bearer("user-alice"))
            .body(Body::empty())
            .unwrap();
        let (status, session) = app.send(request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(session["title"].is_null());
    }

    #[tokio::test]
    async fn entities_timeline_and_keyword_search() {
        let app = test_app();
        let doc_id = app.ingested("user-alice", "Potassium 4.1 mmol/L").await;

        let (status, entity) = app
            .post_json(
                "/api/v1/entities",
                Some("user-alice"),
                serde_json::json!({
                    "document_id": doc_id,
                    "entity_type": "lab_result",
                    "entity_data": {"test": "Potassium", "value": 4.1, "unit": "mmol/L"},
                    "entity_date": "2024-04-02"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let entity_id = entity["id"].as_str().unwrap().to_string();
        assert_eq!(entity["is_verified"], false);

        let (status, fetched) = app
            .get(&format!("/api/v1/entities/{}", entity_id), "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["entity_data"]["test"], "Potassium");
        let (status, _) = app
            .get(&format!("/api/v1/entities/{}", entity_id), "user-bob")
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app
            .post_json(
                "/api/v1/entities",
                Some("user-alice"),
                serde_json::json!({"entity_type": "horoscope", "entity_data": {}}),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "invalid_input");

        let (status, hits) = app
            .get("/api/v1/search/entities?q=POTASSIUM", "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits.as_array().unwrap().len(), 1);
        let (_, hits) = app.get("/api/v1/search/entities?q=potassium", "user-bob").await;
        assert_eq!(hits, serde_json::json!([]));

        let (status, docs) = app
            .get("/api/v1/search/documents?q=mmol&limit=5", "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(docs[0]["id"], doc_id.as_str());
        let (status, body) = app.get("/api/v1/search/documents?q=", "user-alice").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let (status, event) = app
            .post_json(
                "/api/v1/timeline",
                Some("user-alice"),
                serde_json::json!({
                    "event_type": "lab_completed",
                    "title": "Basic metabolic panel",
                    "event_date": "2024-04-02"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let event_id = event["id"].as_str().unwrap().to_string();
        let (status, fetched) = app
            .get(&format!("/api/v1/timeline/{}", event_id), "user-alice")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["title"], "Basic metabolic panel");

        for uri in [
            format!("/api/v1/entities/{}", entity_id),
            format!("/api/v1/timeline/{}", event_id),
        ] {
            let delete = |subject: &str| {
                HttpRequest::delete(uri.as_str())
                    .header(header::AUTHORIZATION, app.bearer(subject))
                    .body(Body::empty())
                    .unwrap()
            };
            assert_eq!(app.send(delete("user-bob")).await.0, StatusCode::NOT_FOUND);
            assert_eq!(app.send(delete("user-alice")).await.0, StatusCode::NO_CONTENT);
            assert_eq!(app.get(&uri, "user-alice").await.0, StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (CoreError::Auth("x".into()), StatusCode::UNAUTHORIZED),
            (CoreError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::not_found("document"), StatusCode::NOT_FOUND),
            (CoreError::transient("x"), StatusCode::SERVICE_UNAVAILABLE),
            (
                CoreError::DimensionMismatch {
                    expected: 4,
                    actual: 3,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (CoreError::Extraction("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                CoreError::Storage(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let app_error = AppError::from(error);
            assert_eq!(app_error.status, expected);
        }
        let hidden = AppError::from(CoreError::Storage(anyhow::anyhow!("disk full")));
        assert_eq!(hidden.message, "internal error");
    }
}
