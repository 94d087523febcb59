use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static HTML_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").expect("html tag regex is valid"));

static WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("documents folder '{0}' does not exist")]
    MissingFolder(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("duplicate document id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub filename: String,
    /// Whitespace separated word count of the cleaned text
    pub token_length: usize,
}

/// A loaded document. `text` is already cleaned and is what gets hashed and
/// embedded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl DocumentRecord {
    /// Build a record from raw text, cleaning it first.
    pub fn new(doc_id: &str, filename: &str, raw: &str) -> Self {
        let text = clean_text(raw);
        let token_length = text.split_whitespace().count();

        DocumentRecord {
            doc_id: doc_id.to_string(),
            text,
            metadata: DocumentMetadata {
                filename: filename.to_string(),
                token_length,
            },
        }
    }
}

/// Lowercase, strip html tags and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let text = text.to_lowercase();
    let text = HTML_TAG_REGEX.replace_all(&text, " ");
    WHITESPACE_REGEX.replace_all(&text, " ").trim().to_string()
}

/// Load every `.txt` file in `folder`, sorted by filename.
///
/// The document id is the file stem. Bytes that are not valid UTF-8 are
/// replaced rather than rejected.
pub fn load_documents(folder: &Path) -> Result<Vec<DocumentRecord>, DocumentError> {
    if !folder.is_dir() {
        return Err(DocumentError::MissingFolder(folder.to_path_buf()));
    }

    let read_err = |source| DocumentError::Read {
        path: folder.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)
        .map_err(read_err)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();

    let mut records: Vec<DocumentRecord> = Vec::with_capacity(files.len());
    for path in files {
        let (Some(filename), Some(doc_id)) = (
            path.file_name().and_then(|n| n.to_str()),
            path.file_stem().and_then(|n| n.to_str()),
        ) else {
            log::warn!("skipping non utf-8 filename {}", path.display());
            continue;
        };

        let bytes = std::fs::read(&path).map_err(|source| DocumentError::Read {
            path: path.clone(),
            source,
        })?;
        let raw = String::from_utf8_lossy(&bytes);

        records.push(DocumentRecord::new(doc_id, filename, &raw));
    }

    log::debug!("loaded {} documents from {}", records.len(), folder.display());

    Ok(records)
}
