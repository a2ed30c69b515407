//! Extension-dispatched document loading.
//!
//! Reads a scanned file, hands its bytes to the matching extractor and wraps
//! the text with the file's provenance. Loading never fails the caller: a file
//! that cannot be read or parsed yields no documents and a warning.

use std::path::Path;
use tracing::{debug, warn};

use crate::extract::{self, ExtractError, MIME_DOC, MIME_DOCX, MIME_MARKDOWN, MIME_PDF};
use crate::models::{FileRecord, RawDocument, SourceMetadata};

/// Extensions with a loader, lowercase and without the dot.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["md", "pdf", "docx", "doc"];

/// Lowercased extension of `path` if a loader exists for it.
pub fn supported_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(ext)
}

pub fn content_type_for(extension: &str) -> Option<&'static str> {
    match extension {
        "md" => Some(MIME_MARKDOWN),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "doc" => Some(MIME_DOC),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentLoader;

impl DocumentLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load one scanned file into zero or more documents.
    pub fn load(&self, record: &FileRecord) -> Vec<RawDocument> {
        match self.load_text(&record.full_path, &record.extension) {
            Ok((text, content_type)) => {
                if text.trim().is_empty() {
                    debug!(path = %record.relative_path, "no extractable text");
                    return Vec::new();
                }
                vec![RawDocument {
                    text,
                    metadata: SourceMetadata::from_record(record, content_type),
                }]
            }
            Err(e) => {
                warn!(path = %record.relative_path, error = %e, "failed to load document");
                Vec::new()
            }
        }
    }

    fn load_text(
        &self,
        path: &Path,
        extension: &str,
    ) -> Result<(String, &'static str), LoadError> {
        let content_type = content_type_for(extension)
            .ok_or_else(|| ExtractError::UnsupportedContentType(extension.to_string()))?;
        let bytes = std::fs::read(path)?;
        let text = extract::extract_text(&bytes, content_type)?;
        Ok((text, content_type))
    }
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}
