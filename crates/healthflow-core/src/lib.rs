//! # HealthFlow Core
//!
//! Shared, WASM-safe logic for HealthFlow: data models, the error
//! taxonomy, chunking, the cached embedding front-end, store and vector
//! index traits, and semantic search.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Provider implementations, persistence and
//! the ingestion pipeline live in the `healthflow` crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
