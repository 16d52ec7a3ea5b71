//! # HealthFlow
//!
//! **A personal health record backend: document ingestion, semantic search
//! and document-grounded chat.**
//!
//! Users upload medical documents (PDFs, scans, Word files, plain text,
//! voice notes). HealthFlow stores the original, extracts its text, splits
//! it into overlapping chunks, embeds each chunk, and answers owner-scoped
//! semantic searches and chat questions from those chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────────┐   ┌──────────┐
//! │  Upload  │──▶│ Blob storage │──▶│ Extract → Chunk → │──▶│  SQLite  │
//! │ HTTP/CLI │   │   (fs root)  │   │       Embed       │   │ + vectors│
//! └──────────┘   └──────────────┘   └───────────────────┘   └────┬─────┘
//!                                                                │
//!                                    ┌───────────────────────────┤
//!                                    ▼                           ▼
//!                              ┌──────────┐               ┌────────────┐
//!                              │  Search  │──────────────▶│    Chat    │
//!                              └──────────┘               └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`documents`] validates an upload, writes the blob through
//!    [`storage`] and records a `pending` document.
//! 2. The [`ingest`] pipeline extracts text ([`extract`]), chunks it with
//!    `healthflow_core::chunk`, and embeds the chunks in bounded-concurrency
//!    batches through the provider in [`embedding`].
//! 3. Chunks whose embedding keeps failing go to a retry queue; the document
//!    settles as `completed`, `partially_completed` or `failed`.
//! 4. [`services::Services::search`] embeds the query and ranks the
//!    owner's chunks by cosine similarity.
//! 5. [`chat`] grounds answers in the top hits and records the references.
//! 6. Everything is exposed through the authenticated HTTP API ([`server`])
//!    and the `healthflow` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema (idempotent) |
//! | [`sqlite_store`] | SQLite implementation of the core store traits |
//! | [`storage`] | Blob storage for uploaded originals |
//! | [`extract`] | Text extraction by MIME type, with optional image OCR |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`ingest`] | Ingestion pipeline, retry queue and cancellation |
//! | [`documents`] | Upload, listing, annotation, deletion, reprocessing |
//! | [`chat`] | Chat sessions and grounded answer generation |
//! | [`records`] | Medical entities, timeline events and keyword search |
//! | [`identity`] | Password login and signed bearer tokens |
//! | [`services`] | Wiring shared by the server and the CLI |
//! | [`server`] | HTTP API (Axum) with CORS |
//! | [`search`], [`get`], [`ingest_cmd`] | CLI commands |

pub mod chat;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod identity;
pub mod ingest;
pub mod ingest_cmd;
pub mod migrate;
pub mod records;
pub mod search;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod storage;

#[cfg(test)]
mod testing;

pub use healthflow_core::store;
