//! ggufmount command-line interface
//!
//! Mounts GGUF archives as editable JSON documents, runs repair passes on
//! them and writes new archives. Mounts are remembered between invocations
//! in a session file.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use ggufmount::{Config, ConfigBuilder, LogFormat, Workspace};
use tracing::debug;

mod exit;
mod output;

use output::Output;

const DEFAULT_CONFIG_FILE: &str = "ggufmount.toml";

/// ggufmount - edit GGUF model archives without regenerating them
#[derive(Parser)]
#[command(name = "ggufmount")]
#[command(about = "Mount, repair and repackage GGUF model archives")]
#[command(long_about = r#"
ggufmount stages the metadata of a GGUF archive as editable JSON documents,
applies targeted repairs, and writes a new archive whose tensor data is copied
byte for byte.

Examples:
  # Inspect an archive
  ggufmount analyze -v model.gguf

  # Mount, clean and save
  ggufmount mount model.gguf model.mnt
  ggufmount strip-telemetry model.mnt
  ggufmount fix-tokenizer model.mnt
  ggufmount save model.mnt model.clean.gguf

  # Forget mounts that are no longer needed
  ggufmount cleanup --force
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML, or JSON by extension)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Print machine-readable JSON results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise an archive without changing it
    Analyze {
        /// List every tensor
        #[arg(short, long)]
        verbose: bool,
        file: PathBuf,
    },

    /// Write the staged documents to a directory without registering a mount
    Extract { file: PathBuf, dir: PathBuf },

    /// Stage an archive into a directory and register the mount
    Mount { file: PathBuf, dir: PathBuf },

    /// Remove repeated end-of-turn token runs and deny-listed tokens
    FixTokenizer {
        /// Mount id or mount directory
        mount: String,
    },

    /// Remove provenance and tracking keys from the metadata document
    StripTelemetry { mount: String },

    /// Replace the tokenizer with the one from another archive
    TransplantTokenizer { mount: String, donor: PathBuf },

    /// Validate the mount and write a new archive
    Save { mount: String, output: PathBuf },

    /// Delete a mount's staged files
    Discard { mount: String },

    /// List registered mounts
    List,

    /// Remove saved and discarded mounts (all mounts with --force)
    Cleanup {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => return report_failure(&e),
    };
    setup_logging(&config);

    match run(cli, config) {
        Ok(()) => ExitCode::from(exit::EXIT_SUCCESS as u8),
        Err(e) => report_failure(&e),
    }
}

fn report_failure(e: &anyhow::Error) -> ExitCode {
    let code = exit::code_for(e);
    debug!(code, "command failed: {e:#}");
    eprintln!("{} {e:#}", style("error:").red().bold());
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Explicit `--config`, else `ggufmount.toml` in the working directory if
/// present, else defaults; environment overrides apply in every case.
fn load_configuration(cli: &Cli) -> Result<Config> {
    let builder = match &cli.config {
        Some(path) => ConfigBuilder::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => ConfigBuilder::from_file(Path::new(DEFAULT_CONFIG_FILE))
            .with_context(|| format!("failed to load {DEFAULT_CONFIG_FILE}"))?,
        None => ConfigBuilder::from_env().context("invalid environment configuration")?,
    };
    builder.log_level(cli.log_level.clone()).build().context("failed to build configuration")
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn setup_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init(),
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}

fn run(cli: Cli, config: Config) -> Result<()> {
    let out = Output::new(cli.json);

    let ws = match cli.command {
        Commands::Analyze { .. } => Workspace::new(config),
        _ => Workspace::open(config).context("failed to open the mount session")?,
    };
    debug!(session = %ws.session_path().display(), mounts = ws.list().len(), "workspace ready");

    match cli.command {
        Commands::Analyze { verbose, file } => {
            let summary = ws
                .analyze(&file, verbose)
                .with_context(|| format!("failed to analyze {}", file.display()))?;
            out.summary(&summary)
        }
        Commands::Extract { file, dir } => {
            let report = ws
                .extract(&file, &dir)
                .with_context(|| format!("failed to extract {}", file.display()))?;
            out.extracted(&report)
        }
        Commands::Mount { file, dir } => {
            let id = ws.mount(&file, &dir).with_context(|| format!("failed to mount {}", file.display()))?;
            ws.persist()?;
            out.mounted(&id)
        }
        Commands::FixTokenizer { mount } => {
            let report = ws.fix_tokenizer(&mount)?;
            ws.persist()?;
            out.repaired(&report)
        }
        Commands::StripTelemetry { mount } => {
            let report = ws.strip_telemetry(&mount)?;
            ws.persist()?;
            out.stripped(&report)
        }
        Commands::TransplantTokenizer { mount, donor } => {
            let report = ws
                .transplant_tokenizer(&mount, &donor)
                .with_context(|| format!("failed to transplant the tokenizer of {}", donor.display()))?;
            ws.persist()?;
            out.transplanted(&report)
        }
        Commands::Save { mount, output } => {
            let report = ws.save(&mount, &output).with_context(|| format!("failed to save {mount}"))?;
            ws.persist()?;
            out.saved(&report)
        }
        Commands::Discard { mount } => {
            let id = ws.discard(&mount)?;
            ws.persist()?;
            out.discarded(&id)
        }
        Commands::List => out.list(&ws.list()),
        Commands::Cleanup { force } => {
            let removed = ws.cleanup(force);
            ws.persist()?;
            out.cleaned(&removed)
        }
    }
}
