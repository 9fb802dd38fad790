//! Mount a GGUF archive as editable JSON documents, transform them, and
//! write a new archive whose tensor bytes are copied verbatim.
//!
//! ```no_run
//! use ggufmount::{Config, Workspace};
//! use std::path::Path;
//!
//! # fn main() -> ggufmount::Result<()> {
//! let ws = Workspace::new(Config::default());
//! let id = ws.mount(Path::new("model.gguf"), Path::new("model.mnt"))?;
//! ws.strip_telemetry(id.as_str())?;
//! ws.fix_tokenizer(id.as_str())?;
//! let report = ws.save(id.as_str(), Path::new("model.clean.gguf"))?;
//! println!("wrote {} ({})", report.output.display(), report.sha256);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod error;
pub mod repackager;
pub mod workspace;

pub use analyzer::{AnalyzeOptions, Summary, TensorPreview, analyze, summarize};
pub use config::{Config, ConfigBuilder, ConfigError, LogFormat};
pub use error::{Error, ErrorKind, Result, ValidationError};
pub use repackager::{SaveReport, save, validate};
pub use workspace::{ExtractReport, Workspace, open_archive};

pub use ggufmount_codec as codec;
pub use ggufmount_passes as passes;
pub use ggufmount_stage as stage;
