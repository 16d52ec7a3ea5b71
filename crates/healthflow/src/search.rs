//! `healthflow search`: semantic search from the command line.
//!
//! Uses the same [`Services::search`] path as
//! `GET /api/v1/search/semantic`, so results match the API.

use anyhow::Result;

use healthflow_core::search::SearchHit;

use crate::config::Config;
use crate::services::Services;

pub async fn search_documents(
    config: &Config,
    owner_id: &str,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
) -> Result<Vec<SearchHit>> {
    let services = Services::connect(config).await?;
    Ok(services.search(owner_id, query, limit, threshold).await?)
}

/// CLI entry point: calls [`search_documents`] and prints results to stdout.
pub async fn run_search(
    config: &Config,
    owner_id: &str,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
) -> Result<()> {
    let results = search_documents(config, owner_id, query, limit, threshold).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            hit.similarity,
            hit.file_name,
            hit.document_type
        );
        println!("    chunk: {}", hit.chunk_index);
        println!("    excerpt: \"{}\"", hit.snippet);
        println!("    document: {}", hit.document_id);
        println!();
    }

    Ok(())
}
