//! Projection of archive metadata into staged documents, and back.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use ggufmount_codec::{ArchiveModel, DEFAULT_ALIGNMENT, MetadataEntry, MetadataValue};
use tracing::{info, warn};

use crate::document::Document;
use crate::error::{MountError, Result};
use crate::manifest::{ExtractionManifest, MANIFEST_FILE, SourceFacts};
use crate::mount::{MountId, MountState, StagedDocuments, VirtualMount, sha256_file};
use crate::projection::{DocumentKind, project};

/// Split archive metadata into the three documents, keeping source order.
pub fn split_metadata(model: &ArchiveModel) -> StagedDocuments {
    let arch = model.architecture();
    let mut metadata = Document::new();
    let mut config = Document::new();
    let mut tokenizer = Document::new();
    for entry in model.metadata() {
        let doc = match project(&entry.key, arch) {
            DocumentKind::Metadata => &mut metadata,
            DocumentKind::Config => &mut config,
            DocumentKind::Tokenizer => &mut tokenizer,
        };
        doc.insert(entry.key.clone(), entry.value.clone());
    }
    StagedDocuments {
        metadata,
        config: (!config.is_empty()).then_some(config),
        tokenizer: (!tokenizer.is_empty()).then_some(tokenizer),
    }
}

/// Write the staged layout for `source` under `destination` and return the
/// (unregistered) mount.
///
/// ```text
/// <destination>/metadata/metadata.json
/// <destination>/tokenizer/tokenizer.json    only with tokenizer keys
/// <destination>/config/model_config.json    only with config keys
/// <destination>/extraction_manifest.json
/// ```
pub fn stage(
    source: Arc<ArchiveModel>,
    source_path: &Path,
    destination: &Path,
) -> Result<VirtualMount> {
    fs::create_dir_all(destination).map_err(|e| MountError::io(destination, e))?;
    let id = MountId::for_destination(destination).map_err(|e| MountError::io(destination, e))?;
    let root = fs::canonicalize(destination).map_err(|e| MountError::io(destination, e))?;

    let documents = split_metadata(&source);
    documents.metadata.store(&root.join(DocumentKind::Metadata.relative_path()))?;
    if let Some(config) = &documents.config {
        config.store(&root.join(DocumentKind::Config.relative_path()))?;
    }
    let mut tokenizer_sha256 = None;
    if let Some(tokenizer) = &documents.tokenizer {
        let path = root.join(DocumentKind::Tokenizer.relative_path());
        tokenizer.store(&path)?;
        tokenizer_sha256 = Some(sha256_file(&path).map_err(|e| MountError::io(&path, e))?);
    }

    let header = source.header();
    let manifest = ExtractionManifest {
        mount_id: id.to_string(),
        source_path: fs::canonicalize(source_path).unwrap_or_else(|_| source_path.to_path_buf()),
        mounted_at: Utc::now(),
        source: SourceFacts {
            version: header.version,
            tensor_count: header.tensor_count,
            metadata_count: header.metadata_count,
            alignment: source.alignment(),
            payload_bytes: source.payload().len(),
        },
        documents: documents.present(),
        tokenizer_sha256,
    };
    manifest.store(&root.join(MANIFEST_FILE))?;

    info!(
        mount = %id,
        source = %source_path.display(),
        metadata = documents.metadata.len(),
        config = documents.config.as_ref().map_or(0, Document::len),
        tokenizer = documents.tokenizer.as_ref().map_or(0, Document::len),
        "staged archive"
    );
    Ok(VirtualMount::new(id, root, source, manifest, documents, MountState::Staged))
}

/// Result of merging staged documents back into an archive model.
#[derive(Debug)]
pub struct Unstaged {
    pub model: ArchiveModel,
    /// Keys found in more than one document.
    pub warnings: Vec<String>,
}

/// Merge the mount's documents (metadata, then config, then tokenizer; later
/// wins) into a model that reuses the source's tensor index and payload.
///
/// Keys that existed in the source keep their source position; new keys
/// follow in document order. Without a `general.alignment` entry the output
/// is laid out with the format default, since that is what readers assume.
pub fn unstage(mount: &VirtualMount) -> Unstaged {
    let source = mount.source();
    let position: HashMap<&str, usize> =
        source.metadata().iter().enumerate().map(|(i, e)| (e.key.as_str(), i)).collect();

    let mut merged: Vec<(String, MetadataValue)> = Vec::new();
    let mut owner: HashMap<String, (usize, DocumentKind)> = HashMap::new();
    let mut warnings = Vec::new();

    for kind in DocumentKind::MERGE_ORDER {
        let Some(doc) = mount.document(kind) else { continue };
        for (key, value) in doc.entries() {
            match owner.get_mut(key) {
                Some((idx, prev)) => {
                    if *prev != kind {
                        let msg = format!("key '{key}' is present in {prev} and {kind}; using {kind}");
                        warn!(mount = %mount.id(), "{msg}");
                        warnings.push(msg);
                        *prev = kind;
                    }
                    merged[*idx].1 = value.clone();
                }
                None => {
                    owner.insert(key.clone(), (merged.len(), kind));
                    merged.push((key.clone(), value.clone()));
                }
            }
        }
    }

    merged.sort_by_key(|(k, _)| position.get(k.as_str()).copied().unwrap_or(usize::MAX));

    let metadata = merged.into_iter().map(|(k, v)| MetadataEntry::new(k, v)).collect();
    let model = ArchiveModel::from_parts(
        source.version(),
        metadata,
        source.tensors().to_vec(),
        source.payload().clone(),
        DEFAULT_ALIGNMENT,
    );
    Unstaged { model, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggufmount_codec::TensorPayload;

    fn model(entries: Vec<(&str, MetadataValue)>) -> Arc<ArchiveModel> {
        let metadata = entries.into_iter().map(|(k, v)| MetadataEntry::new(k, v)).collect();
        let bytes =
            ArchiveModel::from_parts(3, metadata, Vec::new(), TensorPayload::empty(), 32)
                .serialize()
                .unwrap();
        Arc::new(ArchiveModel::parse(bytes).unwrap())
    }

    #[test]
    fn split_follows_projection_table() {
        let m = model(vec![
            ("general.architecture", MetadataValue::String("llama".into())),
            ("general.name", MetadataValue::String("tiny".into())),
            ("llama.block_count", MetadataValue::U32(2)),
            ("tokenizer.ggml.model", MetadataValue::String("gpt2".into())),
        ]);
        let docs = split_metadata(&m);
        assert_eq!(docs.metadata.keys().collect::<Vec<_>>(), ["general.name"]);
        assert_eq!(
            docs.config.unwrap().keys().collect::<Vec<_>>(),
            ["general.architecture", "llama.block_count"]
        );
        assert_eq!(docs.tokenizer.unwrap().keys().collect::<Vec<_>>(), ["tokenizer.ggml.model"]);
    }

    #[test]
    fn optional_documents_are_absent_when_empty() {
        let m = model(vec![("general.name", MetadataValue::String("x".into()))]);
        let docs = split_metadata(&m);
        assert!(docs.config.is_none());
        assert!(docs.tokenizer.is_none());
        assert_eq!(docs.present(), [DocumentKind::Metadata]);
    }

    #[test]
    fn stage_then_unstage_restores_metadata_in_source_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = model(vec![
            ("general.name", MetadataValue::String("tiny".into())),
            ("general.architecture", MetadataValue::String("llama".into())),
            ("tokenizer.ggml.bos_token_id", MetadataValue::U32(1)),
            ("llama.context_length", MetadataValue::U32(128)),
        ]);
        let mount = stage(m.clone(), Path::new("src.gguf"), &dir.path().join("mnt")).unwrap();
        assert_eq!(mount.state(), MountState::Staged);
        assert!(mount.manifest().tokenizer_sha256.is_some());
        assert!(dir.path().join("mnt/config/model_config.json").is_file());

        let out = unstage(&mount);
        assert!(out.warnings.is_empty());
        assert_eq!(out.model.metadata(), m.metadata());
    }

    #[test]
    fn cross_document_duplicates_warn_and_later_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = model(vec![("general.name", MetadataValue::String("a".into()))]);
        let mut mount = stage(m, Path::new("src.gguf"), dir.path()).unwrap();
        let mut tok = Document::new();
        tok.insert("general.name", MetadataValue::String("b".into()));
        mount.put_document(DocumentKind::Tokenizer, Some(tok)).unwrap();

        let out = unstage(&mount);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(
            out.model.metadata_value("general.name"),
            Some(&MetadataValue::String("b".into()))
        );
        assert_eq!(out.model.metadata().len(), 1);
    }
}
