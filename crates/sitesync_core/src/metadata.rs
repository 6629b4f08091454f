use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::{ContentKind, Importance, RecordStatus};

/// Sidecar written next to every generated page; the index reads it instead of re-parsing HTML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub slug: String,
    pub id: u64,
    pub title: String,
    pub date: String,
    pub importance: Importance,
    #[serde(default)]
    pub excerpt: String,
    pub section: ContentKind,
    pub status: RecordStatus,
    pub content_hash: String,
    pub generated_at: String,
}

pub fn sidecar_path(page_path: &Path) -> PathBuf {
    page_path.with_extension("json")
}

/// Short SHA-256 (first 8 bytes, hex) of the source content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn write_metadata(page_path: &Path, metadata: &PageMetadata) -> Result<PathBuf> {
    let path = sidecar_path(page_path);
    let json = serde_json::to_string_pretty(metadata).context("failed to encode page metadata")?;
    fs::write(&path, format!("{json}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// `Ok(None)` when the page has no sidecar (legacy or hand-made pages).
pub fn read_metadata(page_path: &Path) -> Result<Option<PageMetadata>> {
    let path = sidecar_path(page_path);
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(metadata))
}

/// True when the page exists and was generated from content with the same hash.
pub fn is_up_to_date(page_path: &Path, hash: &str) -> bool {
    if !page_path.exists() {
        return false;
    }
    matches!(read_metadata(page_path), Ok(Some(metadata)) if metadata.content_hash == hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str) -> PageMetadata {
        PageMetadata {
            slug: "42".to_string(),
            id: 42,
            title: "Title".to_string(),
            date: "2025-01-01".to_string(),
            importance: Importance::Critical,
            excerpt: "Short".to_string(),
            section: ContentKind::News,
            status: RecordStatus::Complete,
            content_hash: hash.to_string(),
            generated_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn hash_is_short_and_stable() {
        let hash = content_hash("hello");
        assert_eq!(hash.len(), 16);
        assert_eq!(hash, content_hash("hello"));
        assert_ne!(hash, content_hash("hello!"));
    }

    #[test]
    fn sidecar_round_trip_and_freshness() {
        let temp = tempfile::tempdir().expect("tempdir");
        let page = temp.path().join("42.html");
        assert!(read_metadata(&page).expect("read").is_none());

        fs::write(&page, "<html></html>").expect("write page");
        let written = write_metadata(&page, &sample("abc")).expect("write");
        assert_eq!(written, temp.path().join("42.json"));
        assert_eq!(read_metadata(&page).expect("read"), Some(sample("abc")));
        assert!(is_up_to_date(&page, "abc"));
        assert!(!is_up_to_date(&page, "def"));
    }

    #[test]
    fn corrupt_sidecar_is_an_error_and_not_fresh() {
        let temp = tempfile::tempdir().expect("tempdir");
        let page = temp.path().join("1.html");
        fs::write(&page, "<html></html>").expect("write page");
        fs::write(temp.path().join("1.json"), "{not json").expect("write sidecar");
        assert!(read_metadata(&page).is_err());
        assert!(!is_up_to_date(&page, "abc"));
    }
}
