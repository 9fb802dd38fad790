//! GGUF archive codec.
//!
//! Decodes a GGUF v2/v3 archive into an [`ArchiveModel`] (ordered metadata,
//! tensor descriptor table, opaque tensor payload) and encodes it back.
//! Tensor bytes are never interpreted: they are sliced out of a shared,
//! possibly memory-mapped buffer and copied verbatim on write.
//!
//! # Example
//!
//! ```no_run
//! use ggufmount_codec::{ArchiveBytes, ArchiveModel};
//! use std::path::Path;
//!
//! let bytes = ArchiveBytes::map(Path::new("model.gguf")).unwrap();
//! let model = ArchiveModel::parse(bytes).unwrap();
//! println!("{} tensors, alignment {}", model.tensors().len(), model.alignment());
//! let encoded = model.serialize().unwrap();
//! # let _ = encoded;
//! ```

pub mod error;
pub mod model;
pub mod payload;
pub mod reader;
pub mod tensor;
pub mod value;
pub mod writer;

pub use error::{EncodeError, ParseError};
pub use model::{
    ALIGNMENT_KEY, ArchiveHeader, ArchiveModel, DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_MAX,
    GGUF_VERSION_MIN, ParseOptions, align_up,
};
pub use payload::{ArchiveBytes, TensorPayload};
pub use reader::parse_header;
pub use tensor::{BlockLayout, TensorDescriptor, TensorType};
pub use value::{MetadataEntry, MetadataValue, ValueType};

/// Quick check of the leading four bytes.
pub fn check_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == GGUF_MAGIC
}
