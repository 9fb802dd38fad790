//! Staged, editable views of GGUF archives.
//!
//! [`materializer::stage`] projects an archive's metadata into up to three
//! JSON documents on disk (metadata, config, tokenizer) plus a manifest;
//! [`materializer::unstage`] merges them back. The [`MountRegistry`] owns live
//! mounts, gives each its own lock, and enforces the mount lifecycle.

pub mod document;
pub mod error;
pub mod manifest;
pub mod materializer;
pub mod mount;
pub mod projection;
pub mod registry;
pub mod session;

pub use document::{Document, value_from_json, value_to_json};
pub use error::{DocumentError, MountError};
pub use manifest::{ExtractionManifest, MANIFEST_FILE, SourceFacts};
pub use materializer::{Unstaged, split_metadata, stage, unstage};
pub use mount::{MountId, MountState, StagedDocuments, VirtualMount, sha256_file};
pub use projection::{DocumentKind, KeyMatch, PROJECTION, ProjectionRule, project};
pub use registry::{MountInfo, MountRegistry};
pub use session::{DEFAULT_SESSION_FILE, SessionEntry, SessionFile};
