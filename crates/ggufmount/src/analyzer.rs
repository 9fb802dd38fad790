//! Read-only archive summary.

use std::path::{Path, PathBuf};

use ggufmount_codec::{ArchiveModel, MetadataValue};
use ggufmount_passes::{RepairConfig, TelemetryPatterns, count_pathological};
use ggufmount_stage::split_metadata;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::workspace::open_archive;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorPreview {
    pub name: String,
    pub tensor_type: String,
    pub dims: Vec<u64>,
    pub byte_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub path: PathBuf,
    pub file_size: u64,
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
    pub alignment: u64,
    pub architecture: String,
    pub name: String,
    pub has_tokenizer: bool,
    pub has_config: bool,
    pub has_telemetry: bool,
    pub telemetry_keys: Vec<String>,
    pub pathological_tokens: usize,
    pub payload_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensors: Option<Vec<TensorPreview>>,
}

/// Options for [`analyze`].
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub verbose: bool,
    pub repair: RepairConfig,
    pub telemetry: TelemetryPatterns,
    pub default_alignment: Option<u64>,
}

/// Summarise the archive at `path` without staging or modifying anything.
pub fn analyze(path: &Path, options: &AnalyzeOptions) -> Result<Summary> {
    let mut parse = ggufmount_codec::ParseOptions::default();
    if let Some(alignment) = options.default_alignment {
        parse.default_alignment = alignment;
    }
    let model = open_archive(path, &parse)?;
    let file_size = std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
    Ok(summarize(path, file_size, &model, options))
}

/// Summary of an already parsed archive.
pub fn summarize(path: &Path, file_size: u64, model: &ArchiveModel, options: &AnalyzeOptions) -> Summary {
    let header = model.header();
    let documents = split_metadata(model);
    let telemetry_keys = options.telemetry.matching_keys(&documents.metadata);
    let pathological_tokens = documents
        .tokenizer
        .as_ref()
        .map_or(0, |doc| count_pathological(doc, &options.repair));
    let name = model
        .metadata_value("general.name")
        .and_then(MetadataValue::as_str)
        .unwrap_or(UNKNOWN)
        .to_owned();

    let tensors = options.verbose.then(|| {
        model
            .tensors()
            .iter()
            .map(|t| TensorPreview {
                name: t.name.clone(),
                tensor_type: t.tensor_type.to_string(),
                dims: t.dims.clone(),
                byte_len: t.byte_len,
            })
            .collect()
    });

    debug!(path = %path.display(), tensors = header.tensor_count, "analyzed archive");
    Summary {
        path: path.to_path_buf(),
        file_size,
        version: header.version,
        tensor_count: header.tensor_count,
        metadata_count: header.metadata_count,
        alignment: model.alignment(),
        architecture: model.architecture().unwrap_or(UNKNOWN).to_owned(),
        name,
        has_tokenizer: documents.tokenizer.is_some(),
        has_config: documents.config.is_some(),
        has_telemetry: !telemetry_keys.is_empty(),
        telemetry_keys,
        pathological_tokens,
        payload_bytes: model.payload().len(),
        tensors,
    }
}
