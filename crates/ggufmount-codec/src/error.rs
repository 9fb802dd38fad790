use std::io;
use thiserror::Error;

/// Errors returned while decoding a GGUF archive.
///
/// Every variant is fatal to the parse; nothing is partially applied and the
/// source buffer is never modified.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad magic: {found:02x?} (expected \"GGUF\")")]
    MagicMismatch { found: [u8; 4] },
    #[error("unsupported GGUF version: {0} (supported: 2-3)")]
    UnsupportedVersion(u32),
    #[error("truncated input: need {needed} bytes at offset {offset}, have {available}")]
    TruncatedInput { offset: usize, needed: usize, available: usize },
    #[error("unknown metadata value type {tag} at offset {offset}")]
    UnknownMetadataType { tag: u32, offset: usize },
    #[error("metadata arrays nested deeper than {limit} levels at offset {offset}")]
    NestingTooDeep { limit: usize, offset: usize },
    #[error("string at offset {offset} is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidString { offset: usize, valid_up_to: usize },
    #[error("duplicate metadata key: {0}")]
    DuplicateKey(String),
    #[error("invalid tensor layout for '{tensor}': {reason}")]
    InvalidTensorLayout { tensor: String, reason: String },
    #[error("payload length mismatch: tensors need {expected} bytes (up to {max_allowed} with padding), found {actual}")]
    PayloadLengthMismatch { expected: u64, max_allowed: u64, actual: u64 },
}

impl ParseError {
    pub(crate) fn layout(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTensorLayout { tensor: tensor.into(), reason: reason.into() }
    }
}

/// Errors returned while encoding an [`ArchiveModel`](crate::ArchiveModel).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("alignment must be a non-zero power of two, got {0}")]
    InvalidAlignment(u64),
    #[error("tensor '{tensor}' range {start}..{end} lies outside the {payload_len}-byte payload")]
    TensorOutOfPayload { tensor: String, start: u64, end: u64, payload_len: u64 },
    #[error("duplicate metadata key: {0}")]
    DuplicateKey(String),
    #[error("metadata array for '{key}' mixes element types")]
    HeterogeneousArray { key: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;
