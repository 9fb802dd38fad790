//! Registry persistence between processes.
//!
//! The session file lists every registered mount with its manifest and
//! state. Restoring re-maps each source archive so the payload is shared
//! again; mounts whose source is gone or changed are skipped with a warning.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ggufmount_codec::{ArchiveBytes, ArchiveModel, ParseOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::write_json_atomic;
use crate::error::DocumentError;
use crate::manifest::{ExtractionManifest, SourceFacts};
use crate::mount::{MountId, MountState, StagedDocuments, VirtualMount, load_documents};
use crate::registry::MountRegistry;

pub const DEFAULT_SESSION_FILE: &str = ".ggufmount_session.json";
const SESSION_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: MountId,
    pub root: PathBuf,
    pub state: MountState,
    pub manifest: ExtractionManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    pub format: u32,
    pub mounts: Vec<SessionEntry>,
}

impl Default for SessionFile {
    fn default() -> Self {
        Self { format: SESSION_FORMAT, mounts: Vec::new() }
    }
}

impl SessionFile {
    /// Load a session; a missing file is an empty session.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| DocumentError::json(path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DocumentError::io(path, e)),
        }
    }

    pub fn store(&self, path: &Path) -> Result<(), DocumentError> {
        write_json_atomic(path, self)
    }

    /// Capture the registry's current mounts.
    pub fn capture(registry: &MountRegistry) -> Self {
        let mut mounts = Vec::new();
        registry.for_each(|m| {
            mounts.push(SessionEntry {
                id: m.id().clone(),
                root: m.root().to_path_buf(),
                state: m.state(),
                manifest: m.manifest().clone(),
            });
        });
        Self { format: SESSION_FORMAT, mounts }
    }

    /// Re-register every restorable entry. Returns the number restored.
    pub fn restore(&self, registry: &MountRegistry, options: &ParseOptions) -> usize {
        let mut restored = 0;
        for entry in &self.mounts {
            if registry.contains(&entry.id) {
                continue;
            }
            match restore_entry(entry, options) {
                Ok(mount) => {
                    if registry.insert(mount).is_ok() {
                        restored += 1;
                    }
                }
                Err(reason) => warn!(mount = %entry.id, "not restoring mount: {reason}"),
            }
        }
        debug!(restored, total = self.mounts.len(), "session restored");
        restored
    }
}

fn restore_entry(entry: &SessionEntry, options: &ParseOptions) -> Result<VirtualMount, String> {
    let source_path = &entry.manifest.source_path;
    let bytes = ArchiveBytes::map(source_path)
        .map_err(|e| format!("cannot open source {}: {e}", source_path.display()))?;
    let model = ArchiveModel::parse_with(bytes, options)
        .map_err(|e| format!("source {} no longer parses: {e}", source_path.display()))?;

    let header = model.header();
    let facts = SourceFacts {
        version: header.version,
        tensor_count: header.tensor_count,
        metadata_count: header.metadata_count,
        alignment: model.alignment(),
        payload_bytes: model.payload().len(),
    };
    if facts != entry.manifest.source {
        return Err(format!("source {} changed since it was mounted", source_path.display()));
    }

    let documents = if entry.state == MountState::Discarded {
        StagedDocuments::default()
    } else {
        load_documents(&entry.root).map_err(|e| e.to_string())?
    };
    Ok(VirtualMount::new(
        entry.id.clone(),
        entry.root.clone(),
        Arc::new(model),
        entry.manifest.clone(),
        documents,
        entry.state,
    ))
}
