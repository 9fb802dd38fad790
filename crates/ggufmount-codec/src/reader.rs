//! Bounds-checked GGUF decoding.
//!
//! Every primitive read goes through [`ensure`], so a truncated or hostile
//! buffer surfaces as [`ParseError::TruncatedInput`] rather than a panic.
//! Declared counts are checked against the bytes left before anything is
//! allocated in proportion to them.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ParseError, Result};
use crate::model::{
    ALIGNMENT_KEY, ArchiveHeader, ArchiveModel, GGUF_HEADER_LEN, GGUF_MAGIC, GGUF_VERSION_MAX,
    GGUF_VERSION_MIN, ParseOptions, align_up,
};
use crate::payload::{ArchiveBytes, TensorPayload};
use crate::tensor::{TensorDescriptor, TensorType};
use crate::value::{MetadataEntry, MetadataValue, ValueType};

/// Arrays of arrays deeper than this are rejected.
pub const MAX_ARRAY_DEPTH: usize = 8;
/// GGML tensors never carry more than four dims; leave headroom.
pub const MAX_TENSOR_DIMS: u32 = 8;

// key len (u64) + type (u32) + smallest value (1 byte)
const MIN_KV_LEN: usize = 8 + 4 + 1;
// name len (u64) + n_dims (u32) + type (u32) + offset (u64)
const MIN_TENSOR_INFO_LEN: usize = 8 + 4 + 4 + 8;

#[inline]
fn ensure(data: &[u8], offset: usize, needed: usize) -> Result<()> {
    let available = data.len().saturating_sub(offset);
    if needed > available {
        return Err(ParseError::TruncatedInput { offset, needed, available });
    }
    Ok(())
}

#[inline]
fn take<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N]> {
    ensure(data, *offset, N)?;
    let mut b = [0u8; N];
    b.copy_from_slice(&data[*offset..*offset + N]);
    *offset += N;
    Ok(b)
}

pub fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    Ok(take::<1>(data, offset)?[0])
}

pub fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(take(data, offset)?))
}

pub fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(data, offset)?))
}

pub fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(data, offset)?))
}

/// Read a `u64` length followed by that many bytes, decoded as UTF-8.
///
/// Invalid UTF-8 fails the parse: re-encoding a substituted string would
/// silently change the bytes written back.
pub fn read_string(data: &[u8], offset: &mut usize) -> Result<String> {
    let start = *offset;
    let len = read_u64(data, offset)?;
    let len = usize::try_from(len).map_err(|_| ParseError::TruncatedInput {
        offset: *offset,
        needed: usize::MAX,
        available: data.len().saturating_sub(*offset),
    })?;
    ensure(data, *offset, len)?;
    let raw = &data[*offset..*offset + len];
    *offset += len;
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(s.to_owned()),
        Err(e) => Err(ParseError::InvalidString { offset: start, valid_up_to: e.valid_up_to() }),
    }
}

fn read_value_type(data: &[u8], offset: &mut usize) -> Result<ValueType> {
    let at = *offset;
    let tag = read_u32(data, offset)?;
    ValueType::from_u32(tag).ok_or(ParseError::UnknownMetadataType { tag, offset: at })
}

/// Read the payload of a value whose tag has already been consumed.
pub fn read_value(
    data: &[u8],
    offset: &mut usize,
    ty: ValueType,
    depth: usize,
) -> Result<MetadataValue> {
    Ok(match ty {
        ValueType::U8 => MetadataValue::U8(read_u8(data, offset)?),
        ValueType::I8 => MetadataValue::I8(read_u8(data, offset)? as i8),
        ValueType::U16 => MetadataValue::U16(read_u16(data, offset)?),
        ValueType::I16 => MetadataValue::I16(read_u16(data, offset)? as i16),
        ValueType::U32 => MetadataValue::U32(read_u32(data, offset)?),
        ValueType::I32 => MetadataValue::I32(read_u32(data, offset)? as i32),
        ValueType::F32 => MetadataValue::F32(f32::from_bits(read_u32(data, offset)?)),
        ValueType::Bool => MetadataValue::Bool(read_u8(data, offset)? != 0),
        ValueType::String => MetadataValue::String(read_string(data, offset)?),
        ValueType::U64 => MetadataValue::U64(read_u64(data, offset)?),
        ValueType::I64 => MetadataValue::I64(read_u64(data, offset)? as i64),
        ValueType::F64 => MetadataValue::F64(f64::from_bits(read_u64(data, offset)?)),
        ValueType::Array => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(ParseError::NestingTooDeep { limit: MAX_ARRAY_DEPTH, offset: *offset });
            }
            let elem_ty = read_value_type(data, offset)?;
            let count = read_u64(data, offset)?;
            let keep = bounded_count(data, *offset, count, elem_ty.min_encoded_size())?;
            let mut items = Vec::with_capacity(keep);
            for _ in 0..count {
                items.push(read_value(data, offset, elem_ty, depth + 1)?);
            }
            MetadataValue::Array(elem_ty, items)
        }
    })
}

/// Check that `count` items of at least `min_len` bytes each can fit in what
/// is left of the buffer, and return the count as a `usize`.
fn bounded_count(data: &[u8], offset: usize, count: u64, min_len: usize) -> Result<usize> {
    let available = data.len().saturating_sub(offset);
    let needed = usize::try_from(count).ok().and_then(|c| c.checked_mul(min_len));
    match needed {
        Some(needed) if needed <= available => Ok(count as usize),
        needed => Err(ParseError::TruncatedInput {
            offset,
            needed: needed.unwrap_or(usize::MAX),
            available,
        }),
    }
}

/// Parse only the fixed 24-byte header.
pub fn parse_header(data: &[u8]) -> Result<ArchiveHeader> {
    let mut offset = 0usize;
    ensure(data, 0, 4)?;
    let magic: [u8; 4] = take(data, &mut offset)?;
    if magic != GGUF_MAGIC {
        return Err(ParseError::MagicMismatch { found: magic });
    }
    let version = read_u32(data, &mut offset)?;
    if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
        return Err(ParseError::UnsupportedVersion(version));
    }
    ensure(data, offset, GGUF_HEADER_LEN - offset)?;
    let tensor_count = read_u64(data, &mut offset)?;
    let metadata_count = read_u64(data, &mut offset)?;
    Ok(ArchiveHeader { version, tensor_count, metadata_count })
}

struct RawTensorInfo {
    name: String,
    dims: Vec<u64>,
    tensor_type: TensorType,
    offset: u64,
}

fn read_tensor_info(data: &[u8], offset: &mut usize) -> Result<RawTensorInfo> {
    let name = read_string(data, offset)?;
    let n_dims = read_u32(data, offset)?;
    if n_dims > MAX_TENSOR_DIMS {
        return Err(ParseError::layout(name, format!("{n_dims} dimensions (max {MAX_TENSOR_DIMS})")));
    }
    ensure(data, *offset, n_dims as usize * 8)?;
    let mut dims = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        dims.push(read_u64(data, offset)?);
    }
    let tensor_type = TensorType(read_u32(data, offset)?);
    let tensor_offset = read_u64(data, offset)?;
    Ok(RawTensorInfo { name, dims, tensor_type, offset: tensor_offset })
}

fn alignment_from(metadata: &[MetadataEntry], default: u64) -> Result<u64> {
    let alignment = match metadata.iter().find(|e| e.key == ALIGNMENT_KEY) {
        Some(entry) => entry.value.as_u64().ok_or_else(|| {
            ParseError::layout("<archive>", format!("{ALIGNMENT_KEY} is not a non-negative integer"))
        })?,
        None => default,
    };
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(ParseError::layout(
            "<archive>",
            format!("alignment {alignment} is not a non-zero power of two"),
        ));
    }
    Ok(alignment)
}

/// Decode a complete archive.
pub(crate) fn parse_archive(bytes: ArchiveBytes, options: &ParseOptions) -> Result<ArchiveModel> {
    let data: &[u8] = &bytes;
    let header = parse_header(data)?;
    let mut offset = GGUF_HEADER_LEN;

    // --- metadata -----------------------------------------------------------
    let kv_count = bounded_count(data, offset, header.metadata_count, MIN_KV_LEN)?;
    let mut metadata = Vec::with_capacity(kv_count);
    let mut seen_keys = HashSet::with_capacity(kv_count);
    for _ in 0..kv_count {
        let key = read_string(data, &mut offset)?;
        let ty = read_value_type(data, &mut offset)?;
        let value = read_value(data, &mut offset, ty, 0)?;
        if !seen_keys.insert(key.clone()) {
            return Err(ParseError::DuplicateKey(key));
        }
        metadata.push(MetadataEntry { key, value });
    }
    let alignment = alignment_from(&metadata, options.default_alignment)?;

    // --- tensor descriptor table --------------------------------------------
    let n_tensors = bounded_count(data, offset, header.tensor_count, MIN_TENSOR_INFO_LEN)?;
    let mut raw = Vec::with_capacity(n_tensors);
    let mut seen_names = HashSet::with_capacity(n_tensors);
    for _ in 0..n_tensors {
        let info = read_tensor_info(data, &mut offset)?;
        if !seen_names.insert(info.name.clone()) {
            return Err(ParseError::layout(info.name, "duplicate tensor name"));
        }
        raw.push(info);
    }
    let table_end = offset as u64;
    let file_len = data.len() as u64;
    let data_start = align_up(table_end, alignment)
        .ok_or_else(|| ParseError::layout("<archive>", "payload start overflows"))?;

    // --- payload --------------------------------------------------------------
    if raw.is_empty() {
        // Only alignment padding may follow an empty descriptor table.
        if file_len > data_start {
            return Err(ParseError::PayloadLengthMismatch {
                expected: 0,
                max_allowed: 0,
                actual: file_len - data_start,
            });
        }
        debug!(version = header.version, kv = metadata.len(), "parsed archive without tensors");
        return Ok(ArchiveModel::assemble(
            header.version,
            alignment,
            metadata,
            Vec::new(),
            TensorPayload::empty(),
        ));
    }
    if data_start > file_len {
        return Err(ParseError::TruncatedInput {
            offset,
            needed: (data_start - table_end) as usize,
            available: (file_len - table_end) as usize,
        });
    }
    let payload_len = file_len - data_start;

    let mut tensors = Vec::with_capacity(raw.len());
    let mut prev_end = 0u64;
    for i in 0..raw.len() {
        let info = &raw[i];
        let byte_len = match info.tensor_type.byte_len(&info.dims) {
            Some(n) => n,
            None if info.tensor_type.is_known() => {
                return Err(ParseError::layout(&info.name, "element count overflows"));
            }
            None => {
                // Opaque type: the range runs to the next tensor or the payload end.
                let next = raw.get(i + 1).map_or(payload_len, |n| n.offset);
                next.checked_sub(info.offset).ok_or_else(|| {
                    ParseError::layout(&info.name, "offset is past the following tensor")
                })?
            }
        };
        if info.offset % alignment != 0 {
            return Err(ParseError::layout(
                &info.name,
                format!("offset {} is not aligned to {alignment}", info.offset),
            ));
        }
        if info.offset < prev_end {
            return Err(ParseError::layout(
                &info.name,
                format!("offset {} overlaps previous tensor ending at {prev_end}", info.offset),
            ));
        }
        let end = info
            .offset
            .checked_add(byte_len)
            .ok_or_else(|| ParseError::layout(&info.name, "byte range overflows"))?;
        prev_end = end;
        tensors.push(TensorDescriptor {
            name: info.name.clone(),
            dims: info.dims.clone(),
            tensor_type: info.tensor_type,
            offset: info.offset,
            byte_len,
        });
    }

    let max_allowed = align_up(prev_end, alignment).unwrap_or(u64::MAX);
    if payload_len < prev_end || payload_len > max_allowed {
        return Err(ParseError::PayloadLengthMismatch {
            expected: prev_end,
            max_allowed,
            actual: payload_len,
        });
    }

    debug!(
        version = header.version,
        kv = metadata.len(),
        tensors = tensors.len(),
        payload = payload_len,
        "parsed archive"
    );
    let payload = TensorPayload::new(bytes.clone(), data_start as usize..data.len());
    Ok(ArchiveModel::assemble(header.version, alignment, metadata, tensors, payload))
}
