//! Rendering of command results: human-readable text by default,
//! pretty-printed JSON on stdout with `--json`.

use anyhow::Result;
use console::style;
use ggufmount::passes::{RepairReport, StripReport, TransplantReport};
use ggufmount::stage::{MountId, MountInfo};
use ggufmount::{ExtractReport, SaveReport, Summary};
use serde::Serialize;
use serde_json::json;

pub struct Output {
    json: bool,
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    pub fn summary(&self, s: &Summary) -> Result<()> {
        self.emit(s, || {
            let mut out = vec![
                format!("{} {}", style("File:").bold(), s.path.display()),
                format!("  Size:          {} bytes", s.file_size),
                format!("  GGUF version:  {}", s.version),
                format!("  Architecture:  {}", s.architecture),
                format!("  Name:          {}", s.name),
                format!("  Alignment:     {}", s.alignment),
                format!("  Metadata keys: {}", s.metadata_count),
                format!("  Tensors:       {} ({} payload bytes)", s.tensor_count, s.payload_bytes),
                format!("  Config:        {}", yes_no(s.has_config)),
                format!(
                    "  Tokenizer:     {}{}",
                    yes_no(s.has_tokenizer),
                    if s.pathological_tokens > 0 {
                        format!(" ({} pathological tokens)", style(s.pathological_tokens).yellow())
                    } else {
                        String::new()
                    }
                ),
            ];
            if s.has_telemetry {
                out.push(format!("  Telemetry:     {}", style(s.telemetry_keys.join(", ")).yellow()));
            } else {
                out.push("  Telemetry:     none".into());
            }
            if let Some(tensors) = &s.tensors {
                out.push(format!("{}", style("Tensors:").bold()));
                for t in tensors {
                    out.push(format!("  {:<40} {:<8} {:?} {} bytes", t.name, t.tensor_type, t.dims, t.byte_len));
                }
            }
            out.join("\n")
        })
    }

    pub fn extracted(&self, r: &ExtractReport) -> Result<()> {
        self.emit(r, || {
            let docs: Vec<String> = r.documents.iter().map(ToString::to_string).collect();
            format!("Extracted {} to {}", docs.join(", "), r.root.display())
        })
    }

    pub fn mounted(&self, id: &MountId) -> Result<()> {
        self.emit(&json!({ "mount_id": id }), || format!("{} {id}", style("Mounted").green()))
    }

    pub fn repaired(&self, r: &RepairReport) -> Result<()> {
        self.emit(r, || {
            let mut out = vec![format!(
                "Removed {} pathological tokens, {} remain",
                r.removed_count, r.remaining_count
            )];
            out.extend(r.dropped_references.iter().map(|d| format!("  {} {d}", style("warning:").yellow())));
            out.join("\n")
        })
    }

    pub fn stripped(&self, r: &StripReport) -> Result<()> {
        self.emit(r, || {
            if r.removed_keys.is_empty() {
                "No telemetry keys found".to_owned()
            } else {
                let mut out = vec![format!("Removed {} telemetry keys:", r.removed_keys.len())];
                out.extend(r.removed_keys.iter().map(|k| format!("  {k}")));
                out.join("\n")
            }
        })
    }

    pub fn transplanted(&self, r: &TransplantReport) -> Result<()> {
        self.emit(r, || {
            let vocab = r.vocab_size.map_or_else(|| "unknown".to_owned(), |v| v.to_string());
            format!("Transplanted {} tokenizer keys (vocabulary size {vocab})", r.transplanted_keys.len())
        })
    }

    pub fn saved(&self, r: &SaveReport) -> Result<()> {
        self.emit(r, || {
            let mut out = vec![
                format!("{} {} ({} bytes)", style("Saved").green(), r.output.display(), r.bytes),
                format!("  sha256: {}", r.sha256),
            ];
            out.extend(r.warnings.iter().map(|w| format!("  {} {w}", style("warning:").yellow())));
            out.join("\n")
        })
    }

    pub fn discarded(&self, id: &MountId) -> Result<()> {
        self.emit(&json!({ "discarded": id }), || format!("Discarded {id}"))
    }

    pub fn list(&self, mounts: &[MountInfo]) -> Result<()> {
        self.emit(&mounts, || {
            if mounts.is_empty() {
                return "No mounts".to_owned();
            }
            mounts
                .iter()
                .map(|m| {
                    let state = m.state.map_or_else(|| "busy".to_owned(), |s| s.to_string());
                    format!("{:<10} {}  <- {}", state, m.id, m.source_path.display())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    pub fn cleaned(&self, removed: &[MountId]) -> Result<()> {
        self.emit(&json!({ "removed": removed }), || {
            if removed.is_empty() {
                "Nothing to clean up".to_owned()
            } else {
                removed.iter().map(|id| format!("Removed {id}")).collect::<Vec<_>>().join("\n")
            }
        })
    }
}
