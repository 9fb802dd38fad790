//! Configuration file format.
//!
//! Loads [`Config`] from a TOML (or, by extension, JSON) file, then applies
//! `GGUFMOUNT_*` environment overrides and validates the result:
//!
//! ```toml
//! [archive]
//! alignment = 32
//!
//! [tokenizer]
//! repetition_threshold = 3
//! end_markers = ["<|end|>", "<end>"]
//!
//! [telemetry]
//! prefixes = ["source.", "training."]
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [session]
//! path = ".ggufmount_session.json"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ggufmount_codec::{DEFAULT_ALIGNMENT, ParseOptions};
use ggufmount_passes::{RepairConfig, TelemetryPatterns};
use ggufmount_stage::DEFAULT_SESSION_FILE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub const ENV_ALIGNMENT: &str = "GGUFMOUNT_ALIGNMENT";
pub const ENV_REPETITION_THRESHOLD: &str = "GGUFMOUNT_REPETITION_THRESHOLD";
pub const ENV_LOG_LEVEL: &str = "GGUFMOUNT_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "GGUFMOUNT_LOG_FORMAT";
pub const ENV_SESSION: &str = "GGUFMOUNT_SESSION";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Alignment used when an archive has no `general.alignment` key.
    pub alignment: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { alignment: DEFAULT_ALIGNMENT }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { path: PathBuf::from(DEFAULT_SESSION_FILE) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub tokenizer: RepairConfig,
    pub telemetry: TelemetryPatterns,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Default configuration as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Load from a file (`.json` is read as JSON, anything else as TOML),
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = Self::read_file(path)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
        Ok(if is_json { serde_json::from_str(&contents)? } else { toml::from_str(&contents)? })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let alignment = self.archive.alignment;
        if alignment == 0 || !alignment.is_power_of_two() || u32::try_from(alignment).is_err() {
            return Err(ConfigError::Validation(format!(
                "archive.alignment must be a non-zero power of two that fits in u32, got {alignment}"
            )));
        }
        if self.tokenizer.repetition_threshold == 0 {
            return Err(ConfigError::Validation("tokenizer.repetition_threshold must be > 0".into()));
        }
        if self.tokenizer.end_markers.is_empty() {
            return Err(ConfigError::Validation("tokenizer.end_markers must not be empty".into()));
        }
        if self.logging.level.parse::<LevelFilter>().is_err() {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of off, error, warn, info, debug, trace; got {:?}",
                self.logging.level
            )));
        }
        if self.session.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("session.path must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `GGUFMOUNT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(ENV_ALIGNMENT) {
            self.archive.alignment = parse_env(ENV_ALIGNMENT, &val)?;
        }
        if let Ok(val) = std::env::var(ENV_REPETITION_THRESHOLD) {
            self.tokenizer.repetition_threshold = parse_env(ENV_REPETITION_THRESHOLD, &val)?;
        }
        if let Ok(val) = std::env::var(ENV_LOG_LEVEL) {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var(ENV_LOG_FORMAT) {
            self.logging.format = val.parse().map_err(|reason| ConfigError::EnvOverride {
                key: ENV_LOG_FORMAT.into(),
                value: val.clone(),
                reason,
            })?;
        }
        if let Ok(val) = std::env::var(ENV_SESSION) {
            self.session.path = PathBuf::from(val);
        }
        Ok(())
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions { default_alignment: self.archive.alignment }
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::EnvOverride {
        key: key.into(),
        value: value.into(),
        reason: e.to_string(),
    })
}

/// Programmatic construction with the same validation as file loading.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a configuration file (with environment overrides applied).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::read_file(path)?;
        config.apply_env_overrides()?;
        Ok(Self { config })
    }

    /// Start from defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(Self { config })
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.config.archive.alignment = alignment;
        self
    }

    pub fn repair(mut self, repair: RepairConfig) -> Self {
        self.config.tokenizer = repair;
        self
    }

    pub fn repetition_threshold(mut self, threshold: usize) -> Self {
        self.config.tokenizer.repetition_threshold = threshold;
        self
    }

    pub fn telemetry(mut self, patterns: TelemetryPatterns) -> Self {
        self.config.telemetry = patterns;
        self
    }

    /// `None` keeps the current level.
    pub fn log_level(mut self, level: Option<String>) -> Self {
        if let Some(level) = level {
            self.config.logging.level = level;
        }
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    pub fn session_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.session.path = path.into();
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: [&str; 5] =
        [ENV_ALIGNMENT, ENV_REPETITION_THRESHOLD, ENV_LOG_LEVEL, ENV_LOG_FORMAT, ENV_SESSION];

    fn with_env<R>(set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let vars: Vec<(&str, Option<&str>)> = ALL_VARS
            .iter()
            .map(|k| (*k, set.iter().find(|(s, _)| s == k).map(|(_, v)| *v)))
            .collect();
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.archive.alignment, 32);
        assert_eq!(cfg.tokenizer.repetition_threshold, 3);
        assert_eq!(cfg.session.path, PathBuf::from(".ggufmount_session.json"));
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    #[serial(ggufmount_env)]
    fn partial_toml_keeps_defaults() {
        let cfg = with_env(&[], || {
            Config::from_toml("[tokenizer]\nrepetition_threshold = 5\n[logging]\nformat = \"json\"\n")
        })
        .unwrap();
        assert_eq!(cfg.tokenizer.repetition_threshold, 5);
        assert_eq!(cfg.tokenizer.end_markers, RepairConfig::default().end_markers);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.telemetry, TelemetryPatterns::default());
    }

    #[test]
    #[serial(ggufmount_env)]
    fn json_files_are_read_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"archive": {"alignment": 64}}"#).unwrap();
        let cfg = with_env(&[], || Config::load(&path)).unwrap();
        assert_eq!(cfg.archive.alignment, 64);
        assert_eq!(cfg.parse_options().default_alignment, 64);
    }

    #[test]
    #[serial(ggufmount_env)]
    fn env_overrides_win_over_the_file() {
        let cfg = with_env(
            &[
                (ENV_ALIGNMENT, "128"),
                (ENV_REPETITION_THRESHOLD, "4"),
                (ENV_LOG_LEVEL, "debug"),
                (ENV_LOG_FORMAT, "compact"),
                (ENV_SESSION, "/tmp/s.json"),
            ],
            || Config::from_toml("[archive]\nalignment = 16\n"),
        )
        .unwrap();
        assert_eq!(cfg.archive.alignment, 128);
        assert_eq!(cfg.tokenizer.repetition_threshold, 4);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Compact);
        assert_eq!(cfg.session.path, PathBuf::from("/tmp/s.json"));
    }

    #[test]
    #[serial(ggufmount_env)]
    fn bad_env_override_names_the_variable() {
        let err = with_env(&[(ENV_ALIGNMENT, "lots")], Config::from_env).unwrap_err();
        match err {
            ConfigError::EnvOverride { key, .. } => assert_eq!(key, ENV_ALIGNMENT),
            other => panic!("expected EnvOverride, got: {other}"),
        }
        let err = with_env(&[(ENV_LOG_FORMAT, "xml")], Config::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvOverride { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let err = Config::builder().alignment(24).build().unwrap_err();
        assert!(err.to_string().contains("power of two"));
        let err = Config::builder().repetition_threshold(0).build().unwrap_err();
        assert!(err.to_string().contains("repetition_threshold"));
        let err = Config::builder().log_level(Some("loud".into())).build().unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn builder_overrides() {
        let cfg = Config::builder()
            .alignment(64)
            .log_level(None)
            .log_format(LogFormat::Json)
            .session_path("s.json")
            .build()
            .unwrap();
        assert_eq!(cfg.archive.alignment, 64);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.session.path, PathBuf::from("s.json"));
    }

    #[test]
    fn default_toml_parses_back() {
        let text = Config::default_toml().unwrap();
        let cfg: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
