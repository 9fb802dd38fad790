//! Shared, immutable archive bytes and the tensor payload view over them.

use std::fmt;
use std::fs::File;
use std::io;
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;

use crate::tensor::TensorDescriptor;

enum Backing {
    Owned(Vec<u8>),
    Mapped(memmap2::Mmap),
}

/// Reference-counted archive bytes, either owned or memory-mapped.
///
/// Cloning is cheap; every clone views the same buffer.
#[derive(Clone)]
pub struct ArchiveBytes(Arc<Backing>);

impl ArchiveBytes {
    /// Memory-map a source archive read-only.
    ///
    /// The mapping is released when the last clone is dropped.
    pub fn map(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and this crate never writes through it.
        // The source file is never opened for writing by this toolset.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self(Arc::new(Backing::Mapped(mmap))))
    }

    /// Copy `data` into a fresh owned buffer, reporting allocation failure
    /// instead of aborting.
    pub fn copy_from_slice(data: &[u8]) -> io::Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(data.len()).map_err(|e| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("cannot allocate {} bytes for archive: {e}", data.len()),
            )
        })?;
        buf.extend_from_slice(data);
        Ok(Self::from(buf))
    }

    pub fn is_mapped(&self) -> bool {
        matches!(*self.0, Backing::Mapped(_))
    }
}

impl From<Vec<u8>> for ArchiveBytes {
    fn from(v: Vec<u8>) -> Self {
        Self(Arc::new(Backing::Owned(v)))
    }
}

impl Deref for ArchiveBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &*self.0 {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

impl fmt::Debug for ArchiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveBytes")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// The tensor data region of an archive.
///
/// Opaque: it is only ever sliced per tensor or copied whole, never decoded.
#[derive(Clone)]
pub struct TensorPayload {
    bytes: ArchiveBytes,
    start: usize,
    len: usize,
}

impl TensorPayload {
    pub(crate) fn new(bytes: ArchiveBytes, range: Range<usize>) -> Self {
        debug_assert!(range.end <= bytes.len());
        Self { bytes, start: range.start, len: range.end - range.start }
    }

    /// A payload spanning all of `bytes`.
    pub fn whole(bytes: impl Into<ArchiveBytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len();
        Self::new(bytes, 0..len)
    }

    pub fn empty() -> Self {
        Self::new(ArchiveBytes::from(Vec::new()), 0..0)
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region, unchanged.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.len]
    }

    /// Bytes of one tensor, `None` if the descriptor points outside the region.
    pub fn tensor_bytes(&self, desc: &TensorDescriptor) -> Option<&[u8]> {
        let start = usize::try_from(desc.offset).ok()?;
        let end = start.checked_add(usize::try_from(desc.byte_len).ok()?)?;
        self.as_bytes().get(start..end)
    }

    /// `true` if both payloads view the same underlying buffer.
    pub fn shares_buffer_with(&self, other: &TensorPayload) -> bool {
        Arc::ptr_eq(&self.bytes.0, &other.bytes.0)
    }
}

impl fmt::Debug for TensorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorPayload")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("mapped", &self.bytes.is_mapped())
            .finish()
    }
}
