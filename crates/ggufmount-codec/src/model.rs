//! In-memory archive model.

use std::io::Write;

use crate::error::{EncodeError, ParseError, Result};
use crate::payload::{ArchiveBytes, TensorPayload};
use crate::tensor::TensorDescriptor;
use crate::value::{MetadataEntry, MetadataValue};
use crate::{reader, writer};

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
pub const GGUF_VERSION_MIN: u32 = 2;
pub const GGUF_VERSION_MAX: u32 = 3;
/// Magic + version + tensor count + metadata count.
pub const GGUF_HEADER_LEN: usize = 4 + 4 + 8 + 8;
/// Payload alignment when `general.alignment` is absent.
pub const DEFAULT_ALIGNMENT: u64 = 32;
pub const ALIGNMENT_KEY: &str = "general.alignment";

/// Round `n` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(n: u64, alignment: u64) -> Option<u64> {
    let mask = alignment.checked_sub(1)?;
    n.checked_add(mask).map(|v| v & !mask)
}

/// Fixed header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
}

/// Knobs for [`ArchiveModel::parse_with`].
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Used when the archive carries no `general.alignment` entry.
    pub default_alignment: u64,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { default_alignment: DEFAULT_ALIGNMENT }
    }
}

/// A decoded GGUF archive.
///
/// Metadata order and tensor order are preserved exactly as found. Tensor
/// offsets in [`tensors`](Self::tensors) refer to [`payload`](Self::payload);
/// the writer recomputes them for the output.
#[derive(Debug, Clone)]
pub struct ArchiveModel {
    version: u32,
    alignment: u64,
    metadata: Vec<MetadataEntry>,
    tensors: Vec<TensorDescriptor>,
    payload: TensorPayload,
}

impl ArchiveModel {
    pub fn parse(bytes: impl Into<ArchiveBytes>) -> Result<Self> {
        Self::parse_with(bytes, &ParseOptions::default())
    }

    pub fn parse_with(bytes: impl Into<ArchiveBytes>, options: &ParseOptions) -> Result<Self> {
        reader::parse_archive(bytes.into(), options)
    }

    pub(crate) fn assemble(
        version: u32,
        alignment: u64,
        metadata: Vec<MetadataEntry>,
        tensors: Vec<TensorDescriptor>,
        payload: TensorPayload,
    ) -> Self {
        Self { version, alignment, metadata, tensors, payload }
    }

    /// Rebuild a model from edited metadata plus an existing tensor index and
    /// payload.
    ///
    /// Alignment is re-derived from `general.alignment` (falling back to
    /// `default_alignment`). An entry that is not an unsigned integer gives
    /// alignment 0. Nothing is validated here; [`write_to`](Self::write_to)
    /// rejects inconsistent models with [`EncodeError::InvalidAlignment`].
    pub fn from_parts(
        version: u32,
        metadata: Vec<MetadataEntry>,
        tensors: Vec<TensorDescriptor>,
        payload: TensorPayload,
        default_alignment: u64,
    ) -> Self {
        let alignment = match metadata.iter().find(|e| e.key == ALIGNMENT_KEY) {
            Some(e) => e.value.as_u64().unwrap_or(0),
            None => default_alignment,
        };
        Self { version, alignment, metadata, tensors, payload }
    }

    pub fn header(&self) -> ArchiveHeader {
        ArchiveHeader {
            version: self.version,
            tensor_count: self.tensors.len() as u64,
            metadata_count: self.metadata.len() as u64,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn metadata(&self) -> &[MetadataEntry] {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorDescriptor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn tensor_bytes(&self, name: &str) -> Option<&[u8]> {
        self.payload.tensor_bytes(self.tensor(name)?)
    }

    pub fn payload(&self) -> &TensorPayload {
        &self.payload
    }

    pub fn architecture(&self) -> Option<&str> {
        self.metadata_value("general.architecture").and_then(MetadataValue::as_str)
    }

    /// Stream the encoded archive into `w`, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::result::Result<u64, EncodeError> {
        writer::write_archive(self, w)
    }

    /// Encode the archive into a fresh buffer.
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(self.payload.len() as usize + 4096);
        self.write_to(&mut out)?;
        Ok(out)
    }
}

impl TryFrom<&[u8]> for ArchiveModel {
    type Error = ParseError;

    fn try_from(data: &[u8]) -> Result<Self> {
        Self::parse(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 32), Some(0));
        assert_eq!(align_up(1, 32), Some(32));
        assert_eq!(align_up(64, 32), Some(64));
        assert_eq!(align_up(65, 8), Some(72));
        assert_eq!(align_up(u64::MAX, 32), None);
        assert_eq!(align_up(5, 0), None);
    }

    #[test]
    fn from_parts_reads_alignment_key() {
        let meta = vec![MetadataEntry::new(ALIGNMENT_KEY, MetadataValue::U32(64))];
        let m = ArchiveModel::from_parts(3, meta, Vec::new(), TensorPayload::empty(), 32);
        assert_eq!(m.alignment(), 64);

        let m = ArchiveModel::from_parts(3, Vec::new(), Vec::new(), TensorPayload::empty(), 16);
        assert_eq!(m.alignment(), 16);
    }
}
