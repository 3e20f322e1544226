//! File attachments: validation, content-addressed storage, text extraction.
//!
//! Uploaded files are stored under `<scope>/attachments/` named by the first
//! 16 hex characters of the SHA-256 of their bytes, so duplicate uploads
//! collapse to one file. Text documents contribute extracted context to the
//! deliberation prompt; PDFs and images are stored but yield no extract here.

use crate::error::{CouncilError, Result};
use crate::storage::user_scope_dir;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const TEXT_EXTENSIONS: [&str; 9] = ["txt", "md", "json", "csv", "xml", "html", "py", "js", "ts"];
const PDF_EXTENSIONS: [&str; 1] = ["pdf"];
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

pub const MAX_TEXT_SIZE: usize = 1024 * 1024;
pub const MAX_PDF_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024;

/// Broad class of a supported attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Text,
    Pdf,
    Image,
}

/// Metadata describing one stored attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Content hash prefix; doubles as the stored file stem.
    pub id: String,
    pub filename: String,
    pub stored_name: String,
    pub file_type: FileType,
    pub mime_type: String,
    pub size: usize,
}

fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Classify a filename by extension; `None` means unsupported.
pub fn file_type(filename: &str) -> Option<FileType> {
    let ext = extension(filename);
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileType::Text)
    } else if PDF_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileType::Pdf)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileType::Image)
    } else {
        None
    }
}

/// Validate type and size limits. Content exactly at the limit passes.
pub fn validate(filename: &str, content: &[u8]) -> Result<FileType> {
    let file_type = file_type(filename).ok_or_else(|| {
        CouncilError::Precondition(format!("Unsupported file type: .{}", extension(filename)))
    })?;

    let limit = match file_type {
        FileType::Text => MAX_TEXT_SIZE,
        FileType::Pdf => MAX_PDF_SIZE,
        FileType::Image => MAX_IMAGE_SIZE,
    };
    if content.len() > limit {
        return Err(CouncilError::Precondition(format!(
            "File too large (max {} bytes for this type)",
            limit
        )));
    }

    Ok(file_type)
}

/// Attachment storage rooted at the data directory.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn dir_for(&self, user: Option<&str>) -> PathBuf {
        user_scope_dir(&self.base_dir, user).join("attachments")
    }

    /// Validate and persist an upload, returning its metadata.
    pub fn save(&self, filename: &str, content: &[u8], user: Option<&str>) -> Result<AttachmentMeta> {
        let file_type = validate(filename, content)?;

        let digest = Sha256::digest(content);
        let id = hex::encode(&digest[..8]); // first 16 hex chars
        let ext = extension(filename);
        let stored_name = if ext.is_empty() {
            id.clone()
        } else {
            format!("{}.{}", id, ext)
        };

        let dir = self.dir_for(user);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(&stored_name), content)?;

        let mime_type = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(AttachmentMeta {
            id,
            filename: filename.to_string(),
            stored_name,
            file_type,
            mime_type,
            size: content.len(),
        })
    }

    fn read(&self, meta: &AttachmentMeta, user: Option<&str>) -> Option<Vec<u8>> {
        std::fs::read(self.dir_for(user).join(&meta.stored_name)).ok()
    }

    /// Build the combined document-context block for a set of attachments.
    ///
    /// Text files contribute their contents under a per-file heading; other
    /// types (and missing files) contribute nothing.
    pub fn process(&self, attachments: &[AttachmentMeta], user: Option<&str>) -> String {
        let mut parts = Vec::new();

        for meta in attachments {
            if meta.file_type != FileType::Text {
                continue;
            }
            let Some(content) = self.read(meta, user) else {
                tracing::warn!(id = %meta.id, "attachment file missing, skipping");
                continue;
            };
            let text = String::from_utf8_lossy(&content);
            parts.push(format!("## {}\n\n{}", meta.filename, text));
        }

        parts.join("\n\n---\n\n")
    }
}

/// Wrap extracted document text for inclusion in the stage-1 context.
pub fn attachment_context(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!("## Attached Documents\n\n{}\n\n---\n\n", text)
    }
}
