//! A staged, editable view of one archive.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ggufmount_codec::ArchiveModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::document::Document;
use crate::error::{MountError, Result};
use crate::manifest::{ExtractionManifest, MANIFEST_FILE};
use crate::projection::DocumentKind;

/// Mount identifier: the canonicalised destination directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(String);

impl MountId {
    /// Derive the id for `destination`. The directory must already exist.
    pub fn for_destination(destination: &Path) -> io::Result<Self> {
        let canonical = fs::canonicalize(destination)?;
        Ok(Self(canonical.to_string_lossy().into_owned()))
    }

    /// Wrap an id recorded earlier (e.g. in a session file).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a mount.
///
/// `Staged -> Modified -> Saved | Discarded`, `Staged -> Saved | Discarded`,
/// `Saved -> Discarded`. Terminal states never return to `Modified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountState {
    Staged,
    Modified,
    Saved,
    Discarded,
}

impl MountState {
    pub fn can_transition_to(self, next: MountState) -> bool {
        use MountState::*;
        matches!(
            (self, next),
            (Staged, Modified)
                | (Modified, Modified)
                | (Staged | Modified, Saved)
                | (Staged | Modified | Saved, Discarded)
        )
    }

    /// Whether passes may still edit documents.
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Staged | Self::Modified)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Saved | Self::Discarded)
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Staged => "staged",
            Self::Modified => "modified",
            Self::Saved => "saved",
            Self::Discarded => "discarded",
        })
    }
}

/// In-memory copies of the staged documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedDocuments {
    pub metadata: Document,
    pub config: Option<Document>,
    pub tokenizer: Option<Document>,
}

impl StagedDocuments {
    pub fn get(&self, kind: DocumentKind) -> Option<&Document> {
        match kind {
            DocumentKind::Metadata => Some(&self.metadata),
            DocumentKind::Config => self.config.as_ref(),
            DocumentKind::Tokenizer => self.tokenizer.as_ref(),
        }
    }

    pub fn present(&self) -> Vec<DocumentKind> {
        DocumentKind::MERGE_ORDER.into_iter().filter(|k| self.get(*k).is_some()).collect()
    }
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// One staged archive: documents on disk plus the shared source model they
/// were projected from.
#[derive(Debug)]
pub struct VirtualMount {
    id: MountId,
    root: PathBuf,
    source: Arc<ArchiveModel>,
    manifest: ExtractionManifest,
    documents: StagedDocuments,
    state: MountState,
}

impl VirtualMount {
    pub(crate) fn new(
        id: MountId,
        root: PathBuf,
        source: Arc<ArchiveModel>,
        manifest: ExtractionManifest,
        documents: StagedDocuments,
        state: MountState,
    ) -> Self {
        Self { id, root, source, manifest, documents, state }
    }

    pub fn id(&self) -> &MountId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn source(&self) -> &Arc<ArchiveModel> {
        &self.source
    }

    pub fn source_path(&self) -> &Path {
        &self.manifest.source_path
    }

    pub fn manifest(&self) -> &ExtractionManifest {
        &self.manifest
    }

    pub fn documents(&self) -> &StagedDocuments {
        &self.documents
    }

    pub fn document(&self, kind: DocumentKind) -> Option<&Document> {
        self.documents.get(kind)
    }

    pub fn document_path(&self, kind: DocumentKind) -> PathBuf {
        self.root.join(kind.relative_path())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Move to `next`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, next: MountState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MountError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!(mount = %self.id, from = %self.state, to = %next, "mount state change");
        self.state = next;
        Ok(())
    }

    /// Fail unless the documents may still be edited.
    pub fn ensure_editable(&self) -> Result<()> {
        if self.state.is_editable() {
            Ok(())
        } else {
            Err(MountError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: MountState::Modified,
            })
        }
    }

    /// Re-read every staged document from disk; files that do not exist
    /// leave their document absent (metadata becomes empty).
    pub fn refresh(&mut self) -> Result<()> {
        self.documents = load_documents(&self.root)?;
        Ok(())
    }

    /// Replace one document and write it to disk immediately. `None` removes
    /// an optional document's file; the metadata document is always kept.
    pub fn put_document(&mut self, kind: DocumentKind, doc: Option<Document>) -> Result<()> {
        let path = self.document_path(kind);
        match (&doc, kind) {
            (Some(d), _) => d.store(&path)?,
            (None, DocumentKind::Metadata) => Document::new().store(&path)?,
            (None, _) => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MountError::io(&path, e)),
            },
        }
        match kind {
            DocumentKind::Metadata => self.documents.metadata = doc.unwrap_or_default(),
            DocumentKind::Config => self.documents.config = doc,
            DocumentKind::Tokenizer => self.documents.tokenizer = doc,
        }
        Ok(())
    }

    /// Record that a pass changed the documents.
    pub fn mark_modified(&mut self) -> Result<()> {
        self.transition(MountState::Modified)
    }

    /// `true` if the tokenizer document on disk differs from what was staged.
    pub fn tokenizer_edited(&self) -> Result<bool> {
        let path = self.document_path(DocumentKind::Tokenizer);
        let current = match sha256_file(&path) {
            Ok(h) => Some(h),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(MountError::io(&path, e)),
        };
        Ok(current != self.manifest.tokenizer_sha256)
    }

    /// Delete the files staging created, then any directories left empty.
    /// Nothing else under the mount root is touched.
    pub fn remove_artifacts(&self) -> Result<()> {
        for kind in DocumentKind::MERGE_ORDER {
            remove_if_present(&self.document_path(kind))?;
        }
        remove_if_present(&self.manifest_path())?;
        for kind in DocumentKind::MERGE_ORDER {
            remove_dir_if_empty(&self.root.join(kind.dir_name()));
        }
        remove_dir_if_empty(&self.root);
        debug!(mount = %self.id, "removed staging artifacts");
        Ok(())
    }
}

pub(crate) fn load_documents(root: &Path) -> Result<StagedDocuments> {
    let load = |kind: DocumentKind| -> Result<Option<Document>> {
        let path = root.join(kind.relative_path());
        if path.is_file() { Ok(Some(Document::load(&path)?)) } else { Ok(None) }
    };
    Ok(StagedDocuments {
        metadata: load(DocumentKind::Metadata)?.unwrap_or_default(),
        config: load(DocumentKind::Config)?,
        tokenizer: load(DocumentKind::Tokenizer)?,
    })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MountError::io(path, e)),
    }
}

fn remove_dir_if_empty(path: &Path) {
    // remove_dir refuses non-empty directories.
    if let Err(e) = fs::remove_dir(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "left directory in place");
        }
    }
}
