//! Tokenizer transplant from a donor archive.

use std::path::Path;

use ggufmount_codec::{ArchiveBytes, ArchiveModel, MetadataValue, ParseOptions};
use ggufmount_stage::{Document, DocumentKind, VirtualMount, project};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PassError;
use crate::tokenizer::TOKENS_KEY;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransplantReport {
    pub transplanted_keys: Vec<String>,
    pub vocab_size: Option<u64>,
    /// Vocabulary-size keys rewritten to the donor's token count.
    pub updated_keys: Vec<String>,
}

/// Open and parse a donor archive.
pub fn open_donor(path: &Path, options: &ParseOptions) -> Result<ArchiveModel, PassError> {
    let bytes = ArchiveBytes::map(path)
        .map_err(|source| PassError::DonorIo { path: path.to_path_buf(), source })?;
    ArchiveModel::parse_with(bytes, options)
        .map_err(|source| PassError::DonorParse { path: path.to_path_buf(), source })
}

/// Donor keys that project into the tokenizer document.
pub fn donor_tokenizer(donor: &ArchiveModel) -> Document {
    let arch = donor.architecture();
    let mut doc = Document::new();
    for entry in donor.metadata() {
        if project(&entry.key, arch) == DocumentKind::Tokenizer {
            doc.insert(entry.key.clone(), entry.value.clone());
        }
    }
    doc
}

/// Rewrite `key` in `doc` to `size`, keeping its integer type.
fn set_size(doc: &mut Document, key: &str, size: u64) -> bool {
    let Some(ty) = doc.get(key).map(MetadataValue::value_type) else { return false };
    match MetadataValue::integer_of(ty, size) {
        Some(v) => {
            doc.insert(key, v);
            true
        }
        None => {
            warn!(key, size, "vocabulary size does not fit the existing type; left as is");
            false
        }
    }
}

/// Replace the mount's tokenizer document with the donor's tokenizer keys
/// and update vocabulary-size keys (`<arch>.vocab_size` in config,
/// `general.vocab_size` in metadata) when present.
pub fn transplant_tokenizer(
    mount: &mut VirtualMount,
    donor: &ArchiveModel,
) -> Result<TransplantReport, PassError> {
    mount.ensure_editable()?;
    mount.refresh()?;

    let tokenizer = donor_tokenizer(donor);
    if tokenizer.is_empty() {
        return Err(PassError::NoTokenizerPresent("donor archive".into()));
    }
    let vocab_size = tokenizer
        .get(TOKENS_KEY)
        .and_then(MetadataValue::as_array)
        .map(|(_, items)| items.len() as u64);
    let transplanted_keys: Vec<String> = tokenizer.keys().map(str::to_owned).collect();

    let mut updated_keys = Vec::new();
    if let Some(size) = vocab_size {
        if let Some(mut config) = mount.document(DocumentKind::Config).cloned() {
            let arch = config.get("general.architecture").and_then(MetadataValue::as_str).map(str::to_owned);
            if let Some(key) = arch.map(|a| format!("{a}.vocab_size")) {
                if set_size(&mut config, &key, size) {
                    mount.put_document(DocumentKind::Config, Some(config))?;
                    updated_keys.push(key);
                }
            }
        }
        let mut metadata = mount.documents().metadata.clone();
        if set_size(&mut metadata, "general.vocab_size", size) {
            mount.put_document(DocumentKind::Metadata, Some(metadata))?;
            updated_keys.push("general.vocab_size".into());
        }
    }

    mount.put_document(DocumentKind::Tokenizer, Some(tokenizer))?;
    mount.mark_modified()?;
    info!(
        mount = %mount.id(),
        keys = transplanted_keys.len(),
        vocab_size,
        "transplanted tokenizer"
    );
    Ok(TransplantReport { transplanted_keys, vocab_size, updated_keys })
}
