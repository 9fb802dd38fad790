//! GGUF encoding.
//!
//! Output tensor offsets are always recomputed from the current tensor order
//! and alignment; source offsets are only used to locate bytes in the payload.

use std::collections::HashSet;
use std::io::{self, Write};

use tracing::trace;

use crate::error::EncodeError;
use crate::model::{ArchiveModel, GGUF_MAGIC, align_up};
use crate::value::MetadataValue;

const ZEROS: [u8; 256] = [0; 256];

/// Tracks the absolute output position so padding can be computed without
/// requiring `Seek`.
struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Bytes of zero padding needed to bring `pos` to a multiple of `alignment`.
pub fn padding_for_alignment(pos: u64, alignment: u64) -> u64 {
    align_up(pos, alignment).map_or(0, |aligned| aligned - pos)
}

fn write_zeros<W: Write>(w: &mut W, mut n: u64) -> io::Result<()> {
    while n > 0 {
        let chunk = n.min(ZEROS.len() as u64) as usize;
        w.write_all(&ZEROS[..chunk])?;
        n -= chunk as u64;
    }
    Ok(())
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

/// Write a value without its leading type tag.
pub fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> io::Result<()> {
    match value {
        MetadataValue::U8(v) => w.write_all(&[*v]),
        MetadataValue::I8(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::U16(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::I16(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::U32(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::I32(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::F32(v) => w.write_all(&v.to_bits().to_le_bytes()),
        MetadataValue::Bool(v) => w.write_all(&[u8::from(*v)]),
        MetadataValue::String(s) => write_string(w, s),
        MetadataValue::U64(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::I64(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::F64(v) => w.write_all(&v.to_bits().to_le_bytes()),
        MetadataValue::Array(elem_ty, items) => {
            w.write_all(&elem_ty.as_u32().to_le_bytes())?;
            w.write_all(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                write_value(w, item)?;
            }
            Ok(())
        }
    }
}

fn check(model: &ArchiveModel) -> Result<Vec<u64>, EncodeError> {
    let alignment = model.alignment();
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(EncodeError::InvalidAlignment(alignment));
    }

    let mut keys = HashSet::with_capacity(model.metadata().len());
    for entry in model.metadata() {
        if !keys.insert(entry.key.as_str()) {
            return Err(EncodeError::DuplicateKey(entry.key.clone()));
        }
        if !entry.value.is_homogeneous() {
            return Err(EncodeError::HeterogeneousArray { key: entry.key.clone() });
        }
    }

    let payload_len = model.payload().len();
    let mut offsets = Vec::with_capacity(model.tensors().len());
    let mut cursor = 0u64;
    for t in model.tensors() {
        let end = t.offset.checked_add(t.byte_len).filter(|&e| e <= payload_len);
        if end.is_none() {
            return Err(EncodeError::TensorOutOfPayload {
                tensor: t.name.clone(),
                start: t.offset,
                end: t.offset.saturating_add(t.byte_len),
                payload_len,
            });
        }
        cursor = align_up(cursor, alignment).ok_or(EncodeError::InvalidAlignment(alignment))?;
        offsets.push(cursor);
        cursor += t.byte_len;
    }
    Ok(offsets)
}

/// Encode `model` into `w`. Returns the total bytes written.
pub(crate) fn write_archive<W: Write>(model: &ArchiveModel, w: &mut W) -> Result<u64, EncodeError> {
    let offsets = check(model)?;
    let alignment = model.alignment();
    let mut out = CountingWriter { inner: w, written: 0 };

    out.write_all(&GGUF_MAGIC)?;
    out.write_all(&model.version().to_le_bytes())?;
    out.write_all(&(model.tensors().len() as u64).to_le_bytes())?;
    out.write_all(&(model.metadata().len() as u64).to_le_bytes())?;

    for entry in model.metadata() {
        write_string(&mut out, &entry.key)?;
        out.write_all(&entry.value.value_type().as_u32().to_le_bytes())?;
        write_value(&mut out, &entry.value)?;
    }

    for (t, offset) in model.tensors().iter().zip(&offsets) {
        write_string(&mut out, &t.name)?;
        out.write_all(&(t.dims.len() as u32).to_le_bytes())?;
        for d in &t.dims {
            out.write_all(&d.to_le_bytes())?;
        }
        out.write_all(&t.tensor_type.0.to_le_bytes())?;
        out.write_all(&offset.to_le_bytes())?;
    }

    if model.tensors().is_empty() {
        out.flush()?;
        return Ok(out.written);
    }

    let pad = padding_for_alignment(out.written, alignment);
    write_zeros(&mut out, pad)?;
    let data_start = out.written;

    for (t, offset) in model.tensors().iter().zip(&offsets) {
        let gap = data_start + offset - out.written;
        write_zeros(&mut out, gap)?;
        // Range was checked against the payload above.
        let bytes = model.payload().tensor_bytes(t).unwrap_or_default();
        out.write_all(bytes)?;
        trace!(tensor = %t.name, offset, len = t.byte_len, "wrote tensor");
    }

    out.flush()?;
    Ok(out.written)
}
