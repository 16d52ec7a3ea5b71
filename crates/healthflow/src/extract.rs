//! Text extraction for uploaded documents.
//!
//! The [`TextExtractor`] trait turns stored bytes plus a MIME type into
//! plain UTF-8 text. [`BuiltinExtractor`] handles:
//!
//! | MIME | Method |
//! |------|--------|
//! | `text/*` | UTF-8 decode |
//! | `application/pdf` | `pdf-extract` |
//! | DOCX | `word/document.xml` via `zip` + `quick-xml` |
//! | `image/*` | optional HTTP OCR endpoint (`extraction.ocr_url`) |
//!
//! Anything else is an [`ExtractError::UnsupportedContentType`]. OCR
//! failures are classified like embedding failures: HTTP 429, 5xx,
//! timeouts and connection errors are transient and the pipeline retries
//! them with backoff. Everything else is recorded on the document, which
//! is marked `failed`.

use async_trait::async_trait;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

use healthflow_core::error::CoreError;

use crate::config::ExtractionConfig;
use crate::embedding::{classify_status, classify_transport};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Ooxml(String),
    #[error("OCR failed: {message}")]
    Ocr { message: String, transient: bool },
}

impl ExtractError {
    /// True when retrying the same bytes may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractError::Ocr { transient: true, .. })
    }

    fn ocr(e: CoreError) -> Self {
        ExtractError::Ocr {
            transient: e.is_transient(),
            message: e.to_string(),
        }
    }
}

impl From<ExtractError> for CoreError {
    fn from(e: ExtractError) -> Self {
        if e.is_transient() {
            CoreError::transient(e.to_string())
        } else {
            CoreError::Extraction(e.to_string())
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractError>;
}

/// Extractor for text, PDF, DOCX and (when configured) OCR'd images.
pub struct BuiltinExtractor {
    ocr: Option<OcrClient>,
}

struct OcrClient {
    url: String,
    client: reqwest::Client,
}

impl BuiltinExtractor {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let ocr = match &config.ocr_url {
            Some(url) => Some(OcrClient {
                url: url.clone(),
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.ocr_timeout_secs))
                    .build()?,
            }),
            None => None,
        };
        Ok(Self { ocr })
    }
}

#[async_trait]
impl TextExtractor for BuiltinExtractor {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_ascii_lowercase();

        if mime.starts_with("text/") {
            return String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()));
        }
        if mime.starts_with("image/") {
            return match &self.ocr {
                Some(ocr) => ocr.recognize(bytes, &mime).await,
                None => Err(ExtractError::UnsupportedContentType(format!(
                    "{} (no OCR endpoint configured)",
                    mime
                ))),
            };
        }

        if mime != MIME_PDF && mime != MIME_DOCX {
            return Err(ExtractError::UnsupportedContentType(mime));
        }
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_binary(&owned, &mime))
            .await
            .map_err(|e| ExtractError::Pdf(format!("extraction task failed: {}", e)))?
    }
}

impl OcrClient {
    /// POST raw image bytes; the endpoint answers `{"text": "..."}`.
    async fn recognize(&self, bytes: &[u8], mime: &str) -> Result<String, ExtractError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ExtractError::ocr(classify_transport("OCR", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::ocr(classify_status("OCR", status, &body)));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExtractError::ocr(classify_transport("OCR", e)))?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| ExtractError::Ocr {
                message: "response has no 'text' field".to_string(),
                transient: false,
            })
    }
}

/// Synchronous extraction for binary formats.
pub fn extract_binary(bytes: &[u8], mime: &str) -> Result<String, ExtractError> {
    match mime {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        _ => Err(ExtractError::UnsupportedContentType(mime.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_paragraphs(&doc_xml)
}

/// Collect `w:t` runs, ending each `w:p` paragraph with a blank line so the
/// chunker can split on paragraph boundaries.
fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with("\n\n") {
                        out.push_str("\n\n");
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn extractor() -> BuiltinExtractor {
        BuiltinExtractor::new(&ExtractionConfig::default()).unwrap()
    }

    fn minimal_docx(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
            body
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let text = extractor()
            .extract("Hémoglobine 13,5".as_bytes(), "text/plain; charset=utf-8")
            .await
            .unwrap();
        assert_eq!(text, "Hémoglobine 13,5");
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let err = extractor()
            .extract(&[0xff, 0xfe, 0x00], "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    #[tokio::test]
    async fn docx_paragraphs_are_separated() {
        let bytes = minimal_docx(&["Discharge summary", "Take metformin twice daily"]);
        let text = extractor().extract(&bytes, MIME_DOCX).await.unwrap();
        assert_eq!(text, "Discharge summary\n\nTake metformin twice daily");
    }

    #[tokio::test]
    async fn image_without_ocr_is_unsupported() {
        let err = extractor().extract(b"\x89PNG", "image/png").await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[tokio::test]
    async fn audio_is_unsupported() {
        let err = extractor().extract(b"ID3", "audio/mpeg").await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_binary(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_binary(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn extraction_error_maps_to_core_error() {
        let core: CoreError = ExtractError::Pdf("bad xref".into()).into();
        assert!(matches!(core, CoreError::Extraction(_)));
    }

    #[test]
    fn ocr_status_classification() {
        let busy = ExtractError::ocr(classify_status(
            "OCR",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "",
        ));
        assert!(busy.is_transient());
        let down = ExtractError::ocr(classify_status(
            "OCR",
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "",
        ));
        assert!(down.is_transient());
        assert!(CoreError::from(down).is_transient());

        let rejected = ExtractError::ocr(classify_status(
            "OCR",
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            "not an image",
        ));
        assert!(!rejected.is_transient());
        assert!(rejected.to_string().contains("not an image"));
        assert!(matches!(
            CoreError::from(rejected),
            CoreError::Extraction(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_ocr_endpoint_is_transient() {
        let config = ExtractionConfig {
            ocr_url: Some("http://127.0.0.1:9/ocr".into()),
            ocr_timeout_secs: 2,
        };
        let err = BuiltinExtractor::new(&config)
            .unwrap()
            .extract(b"\x89PNG", "image/png")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }
}
