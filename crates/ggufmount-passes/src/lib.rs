//! Transformation passes over staged mounts.
//!
//! Every pass re-reads the mount's staged documents, edits them, writes the
//! result back immediately and marks the mount `Modified` when something
//! changed. Tensor data is never touched.

pub mod error;
pub mod telemetry;
pub mod tokenizer;
pub mod transplant;

pub use error::PassError;
pub use telemetry::{StripReport, TelemetryPatterns, strip_telemetry};
pub use tokenizer::{
    RepairConfig, RepairReport, TokenRemap, count_pathological, detect_pathological, fix_tokenizer,
    repair_document,
};
pub use transplant::{TransplantReport, donor_tokenizer, open_donor, transplant_tokenizer};
