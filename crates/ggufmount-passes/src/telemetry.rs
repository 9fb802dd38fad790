//! Removal of provenance and tracking keys from the metadata document.

use ggufmount_stage::{Document, DocumentKind, VirtualMount};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PassError;

/// Key patterns treated as telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryPatterns {
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
}

impl Default for TelemetryPatterns {
    fn default() -> Self {
        let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        Self {
            exact: owned(&[
                "general.source.url",
                "general.source.huggingface.repository",
                "general.license",
                "general.base_model.source",
                "training.dataset",
                "training.data_url",
                "general.author",
                "general.contact",
                "general.tracking_id",
                "source.repository",
            ]),
            prefixes: owned(&[
                "source.",
                "general.source.",
                "general.repo_url",
                "general.url",
                "training.",
                "tracking.",
                "telemetry.",
                "general.base_model.",
                "general.dataset",
            ]),
        }
    }
}

impl TelemetryPatterns {
    pub fn matches(&self, key: &str) -> bool {
        self.exact.iter().any(|e| e == key) || self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Matching keys of `doc`, sorted and deduplicated.
    pub fn matching_keys(&self, doc: &Document) -> Vec<String> {
        let mut keys: Vec<String> = doc.keys().filter(|k| self.matches(k)).map(str::to_owned).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StripReport {
    /// Sorted.
    pub removed_keys: Vec<String>,
}

/// Remove telemetry keys from the metadata document only.
///
/// The tokenizer and config documents are never touched. Running it again
/// removes nothing and leaves the mount state alone.
pub fn strip_telemetry(
    mount: &mut VirtualMount,
    patterns: &TelemetryPatterns,
) -> Result<StripReport, PassError> {
    mount.ensure_editable()?;
    mount.refresh()?;
    let mut doc = mount.documents().metadata.clone();
    let removed_keys = patterns.matching_keys(&doc);
    if removed_keys.is_empty() {
        info!(mount = %mount.id(), "no telemetry keys found");
        return Ok(StripReport::default());
    }
    doc.retain(|k, _| !patterns.matches(k));
    mount.put_document(DocumentKind::Metadata, Some(doc))?;
    mount.mark_modified()?;
    for key in &removed_keys {
        info!(mount = %mount.id(), key = %key, "stripped telemetry key");
    }
    Ok(StripReport { removed_keys })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggufmount_codec::MetadataValue;

    #[test]
    fn exact_and_prefix_patterns() {
        let p = TelemetryPatterns::default();
        assert!(p.matches("source.repository"));
        assert!(p.matches("general.source.url"));
        assert!(p.matches("training.anything"));
        assert!(p.matches("general.url"));
        assert!(p.matches("general.dataset.name"));
        assert!(!p.matches("general.name"));
        assert!(!p.matches("general.architecture"));
        assert!(!p.matches("tokenizer.ggml.tokens"));
    }

    #[test]
    fn matching_keys_are_sorted() {
        let doc = Document::from_entries(vec![
            ("tracking.id".into(), MetadataValue::U8(1)),
            ("general.name".into(), MetadataValue::U8(1)),
            ("general.license".into(), MetadataValue::U8(1)),
        ]);
        assert_eq!(
            TelemetryPatterns::default().matching_keys(&doc),
            ["general.license", "tracking.id"]
        );
    }
}
