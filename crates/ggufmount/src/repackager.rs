//! Validation of staged documents and the atomic write of the new archive.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use ggufmount_codec::{ALIGNMENT_KEY, MetadataValue, ValueType};
use ggufmount_passes::tokenizer::{MERGES_KEY, SCORES_KEY, TOKEN_TYPE_KEY, TOKENS_KEY};
use ggufmount_stage::{Document, DocumentKind, MountError, MountState, VirtualMount, sha256_file, unstage};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub output: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    /// Keys that appeared in more than one document.
    pub warnings: Vec<String>,
}

/// Check every staged document of `mount` as currently held in memory.
///
/// The tokenizer is only checked when it differs from what was staged.
pub fn validate(mount: &VirtualMount) -> Result<(), ValidationError> {
    for kind in DocumentKind::MERGE_ORDER {
        if let Some(doc) = mount.document(kind) {
            if let Some(key) = doc.duplicate_keys().into_iter().next() {
                return Err(ValidationError::DuplicateKey { document: kind, key });
            }
            // hand edits can move the key out of the config document
            if let Some(alignment) = doc.get(ALIGNMENT_KEY) {
                check_alignment(alignment)?;
            }
        }
    }
    if let Some(config) = mount.document(DocumentKind::Config) {
        validate_config(config)?;
    }
    let tokenizer_edited = mount.tokenizer_edited().unwrap_or(true);
    if tokenizer_edited {
        if let Some(tokenizer) = mount.document(DocumentKind::Tokenizer) {
            validate_tokenizer(tokenizer)?;
        }
    }
    debug!(mount = %mount.id(), tokenizer_edited, "documents validated");
    Ok(())
}

/// Arrays homogeneous, alignment a non-zero power of two, architecture a string.
pub fn validate_config(doc: &Document) -> Result<(), ValidationError> {
    let malformed = |key: &str, reason: String| ValidationError::MalformedConfig { key: key.to_owned(), reason };
    for (key, value) in doc.entries() {
        if !value.is_homogeneous() {
            return Err(malformed(key, "array mixes element types".into()));
        }
        if key == ALIGNMENT_KEY {
            check_alignment(value)?;
        }
        if key == "general.architecture" && value.value_type() != ValueType::String {
            return Err(malformed(key, format!("expected a string, got {}", value.value_type())));
        }
    }
    Ok(())
}

fn check_alignment(value: &MetadataValue) -> Result<(), ValidationError> {
    match value.as_u64() {
        Some(a) if a != 0 && a.is_power_of_two() && u32::try_from(a).is_ok() => Ok(()),
        _ => Err(ValidationError::MalformedConfig {
            key: ALIGNMENT_KEY.to_owned(),
            reason: format!("alignment must be a non-zero power of two, got {value:?}"),
        }),
    }
}

/// Token ids in range, parallel arrays as long as the token list, merge
/// parts present in the vocabulary.
pub fn validate_tokenizer(doc: &Document) -> Result<(), ValidationError> {
    let dangling = |key: &str, reason: String| ValidationError::DanglingTokenizerIndex { key: key.to_owned(), reason };
    let tokens = doc.get(TOKENS_KEY).and_then(MetadataValue::as_string_array).unwrap_or_default();
    let count = tokens.len() as u64;

    for key in [SCORES_KEY, TOKEN_TYPE_KEY] {
        if let Some((_, items)) = doc.get(key).and_then(MetadataValue::as_array) {
            if items.len() as u64 != count {
                return Err(dangling(key, format!("{} entries for {count} tokens", items.len())));
            }
        }
    }

    for (key, value) in doc.entries() {
        let ids: Vec<&MetadataValue> = if key.ends_with("_token_id") {
            vec![value]
        } else if key.ends_with("_token_ids") {
            value.as_array().map(|(_, items)| items.iter().collect()).unwrap_or_default()
        } else {
            continue;
        };
        for id in ids {
            // negative ids mean "unset"
            if let Some(id) = id.as_u64() {
                if id >= count {
                    return Err(dangling(key, format!("token id {id} is outside 0..{count}")));
                }
            }
        }
    }

    if let Some(merges) = doc.get(MERGES_KEY).and_then(MetadataValue::as_string_array) {
        let vocab: HashSet<&str> = tokens.iter().copied().collect();
        for rule in merges {
            let Some((left, right)) = rule.split_once(' ') else {
                return Err(dangling(MERGES_KEY, format!("merge rule {rule:?} has no separator")));
            };
            if let Some(missing) = [left, right].into_iter().find(|p| !vocab.contains(p)) {
                return Err(dangling(MERGES_KEY, format!("merge rule {rule:?} uses unknown token {missing:?}")));
            }
        }
    }
    Ok(())
}

/// Absolute form of `output`, which need not exist yet.
fn resolve_output(output: &Path) -> Result<PathBuf> {
    if let Ok(path) = fs::canonicalize(output) {
        return Ok(path);
    }
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = fs::canonicalize(parent).map_err(|e| Error::io(parent, e))?;
    let name = output.file_name().ok_or_else(|| {
        Error::io(output, io::Error::new(io::ErrorKind::InvalidInput, "output path has no file name"))
    })?;
    Ok(dir.join(name))
}

/// Validate, merge and write `mount` to `output`, then mark it `Saved`.
///
/// The archive is written to a temporary file next to `output`, synced and
/// renamed into place. On any error the mount keeps its state and no file
/// appears at `output`.
pub fn save(mount: &mut VirtualMount, output: &Path) -> Result<SaveReport> {
    if !mount.state().can_transition_to(MountState::Saved) {
        return Err(MountError::InvalidTransition {
            id: mount.id().clone(),
            from: mount.state(),
            to: MountState::Saved,
        }
        .into());
    }
    let target = resolve_output(output)?;
    let source = fs::canonicalize(mount.source_path()).unwrap_or_else(|_| mount.source_path().to_path_buf());
    if target == source {
        return Err(ValidationError::OutputIsSource(target).into());
    }

    mount.refresh()?;
    validate(mount)?;
    let unstaged = unstage(mount);

    let dir = target.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    let bytes = {
        let mut w = BufWriter::new(tmp.as_file_mut());
        let n = unstaged.model.write_to(&mut w)?;
        w.flush().map_err(|e| Error::io(&target, e))?;
        n
    };
    tmp.as_file().sync_all().map_err(|e| Error::io(&target, e))?;
    tmp.persist(&target).map_err(|e| Error::io(&target, e.error))?;

    let sha256 = sha256_file(&target).map_err(|e| Error::io(&target, e))?;
    mount.transition(MountState::Saved)?;
    info!(mount = %mount.id(), output = %target.display(), bytes, sha256 = %sha256, "saved archive");
    Ok(SaveReport { output: target, sha256, bytes, warnings: unstaged.warnings })
}
