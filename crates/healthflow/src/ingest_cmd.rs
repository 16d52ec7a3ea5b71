//! CLI commands that drive the ingestion pipeline directly:
//! `healthflow upload`, `healthflow ingest` and `healthflow retry`.

use anyhow::{bail, Context, Result};
use std::path::Path;

use healthflow_core::models::DocumentType;

use crate::config::Config;
use crate::documents::Upload;
use crate::ingest::IngestOutcome;
use crate::services::Services;

/// Guess a MIME type from a file extension.
pub fn guess_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "heic" => "image/heic",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/m4a",
        _ => return None,
    };
    Some(mime)
}

/// Store a local file as a new document, optionally ingesting it inline.
pub async fn run_upload(
    config: &Config,
    owner_id: &str,
    path: &Path,
    document_type: DocumentType,
    mime_override: Option<&str>,
    ingest: bool,
) -> Result<()> {
    let mime_type = match mime_override {
        Some(mime) => mime.to_string(),
        None => match guess_mime(path) {
            Some(mime) => mime.to_string(),
            None => bail!(
                "Cannot infer MIME type for {}; pass --mime",
                path.display()
            ),
        },
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let services = Services::connect(config).await?;
    let doc = services
        .documents
        .upload(
            owner_id,
            Upload {
                file_name,
                mime_type,
                document_type,
                bytes,
            },
        )
        .await?;

    println!("upload");
    println!("  id: {}", doc.id);
    println!("  file: {} ({} bytes)", doc.file_name, doc.file_size);
    println!("  type: {}", doc.document_type);

    if ingest {
        let outcome = services.pipeline.run(owner_id, &doc.id, false).await?;
        print_outcome("ingest", &outcome);
    } else {
        println!("  status: {}", doc.processing_status);
    }
    Ok(())
}

/// Run the pipeline for an existing document.
pub async fn run_ingest(config: &Config, owner_id: &str, id: &str, force: bool) -> Result<()> {
    let services = Services::connect(config).await?;
    let outcome = services.pipeline.run(owner_id, id, force).await?;
    print_outcome("ingest", &outcome);
    Ok(())
}

/// Re-embed the queued chunks of a partially completed document.
pub async fn run_retry(config: &Config, owner_id: &str, id: &str) -> Result<()> {
    let services = Services::connect(config).await?;
    let outcome = services.pipeline.retry_pending(owner_id, id).await?;
    print_outcome("retry", &outcome);
    Ok(())
}

fn print_outcome(label: &str, outcome: &IngestOutcome) {
    println!("{}", label);
    println!("  document: {}", outcome.document_id);
    if outcome.skipped {
        println!("  already completed; nothing to do (use --force to rebuild)");
        return;
    }
    println!("  status: {}", outcome.status);
    println!("  chunks: {}", outcome.chunks);
    println!("  embedded: {}", outcome.embedded);
    println!("  failed: {}", outcome.failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn mime_is_guessed_case_insensitively() {
        assert_eq!(
            guess_mime(&PathBuf::from("scan.PDF")),
            Some("application/pdf")
        );
        assert_eq!(guess_mime(&PathBuf::from("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(guess_mime(&PathBuf::from("memo.m4a")), Some("audio/m4a"));
    }

    #[test]
    fn unknown_extension_has_no_mime() {
        assert_eq!(guess_mime(&PathBuf::from("archive.tar")), None);
        assert_eq!(guess_mime(&PathBuf::from("README")), None);
    }
}
