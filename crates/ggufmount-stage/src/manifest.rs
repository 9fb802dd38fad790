//! `extraction_manifest.json`: where a mount came from and what was staged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::write_json_atomic;
use crate::error::DocumentError;
use crate::projection::DocumentKind;

pub const MANIFEST_FILE: &str = "extraction_manifest.json";

/// Facts about the source archive recorded at stage time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFacts {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
    pub alignment: u64,
    pub payload_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub mount_id: String,
    pub source_path: PathBuf,
    pub mounted_at: DateTime<Utc>,
    pub source: SourceFacts,
    /// Documents written at stage time.
    pub documents: Vec<DocumentKind>,
    /// SHA-256 of the tokenizer document as staged, used to tell whether it
    /// was edited since.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_sha256: Option<String>,
}

impl ExtractionManifest {
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let text = std::fs::read_to_string(path).map_err(|e| DocumentError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| DocumentError::json(path, e))
    }

    pub fn store(&self, path: &Path) -> Result<(), DocumentError> {
        write_json_atomic(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let manifest = ExtractionManifest {
            mount_id: "/tmp/m".into(),
            source_path: "/models/a.gguf".into(),
            mounted_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().to_utc(),
            source: SourceFacts {
                version: 3,
                tensor_count: 2,
                metadata_count: 5,
                alignment: 32,
                payload_bytes: 96,
            },
            documents: vec![DocumentKind::Metadata, DocumentKind::Tokenizer],
            tokenizer_sha256: Some("ab".into()),
        };
        manifest.store(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"mounted_at\": \"2026-01-02T03:04:05Z\""));
        assert_eq!(ExtractionManifest::load(&path).unwrap(), manifest);
    }
}
