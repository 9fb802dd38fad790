//! The command surface: one [`Workspace`] owns the configuration and the
//! mount registry, and resolves user-supplied mount references.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ggufmount_codec::{ArchiveBytes, ArchiveModel, ParseOptions};
use ggufmount_passes::{
    RepairReport, StripReport, TransplantReport, fix_tokenizer, open_donor, strip_telemetry,
    transplant_tokenizer,
};
use ggufmount_stage::{
    DocumentKind, MountError, MountId, MountInfo, MountRegistry, MountState, SessionFile, stage,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::analyzer::{AnalyzeOptions, Summary, analyze};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::repackager::{self, SaveReport};

/// Memory-map and parse the archive at `path`.
pub fn open_archive(path: &Path, options: &ParseOptions) -> Result<ArchiveModel> {
    let bytes = ArchiveBytes::map(path).map_err(|e| Error::io(path, e))?;
    ArchiveModel::parse_with(bytes, options).map_err(|source| Error::Parse { path: path.to_path_buf(), source })
}

/// Result of staging without registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub root: PathBuf,
    pub documents: Vec<DocumentKind>,
}

pub struct Workspace {
    config: Config,
    registry: MountRegistry,
}

impl Workspace {
    /// A workspace with an empty registry.
    pub fn new(config: Config) -> Self {
        Self { config, registry: MountRegistry::new() }
    }

    /// A workspace whose registry is restored from the configured session
    /// file (missing file: empty registry).
    pub fn open(config: Config) -> Result<Self> {
        let ws = Self::new(config);
        let session = SessionFile::load(ws.session_path()).map_err(MountError::from)?;
        let restored = session.restore(&ws.registry, &ws.config.parse_options());
        debug!(restored, session = %ws.session_path().display(), "opened workspace");
        Ok(ws)
    }

    /// Write the registry to the session file.
    pub fn persist(&self) -> Result<()> {
        SessionFile::capture(&self.registry)
            .store(self.session_path())
            .map_err(MountError::from)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    pub fn session_path(&self) -> &Path {
        &self.config.session.path
    }

    pub fn analyze(&self, path: &Path, verbose: bool) -> Result<Summary> {
        analyze(
            path,
            &AnalyzeOptions {
                verbose,
                repair: self.config.tokenizer.clone(),
                telemetry: self.config.telemetry.clone(),
                default_alignment: Some(self.config.archive.alignment),
            },
        )
    }

    fn open_source(&self, path: &Path) -> Result<Arc<ArchiveModel>> {
        open_archive(path, &self.config.parse_options()).map(Arc::new)
    }

    /// Stage `path` into `dir` without registering a mount.
    pub fn extract(&self, path: &Path, dir: &Path) -> Result<ExtractReport> {
        let source = self.open_source(path)?;
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let id = MountId::for_destination(dir).map_err(|e| Error::io(dir, e))?;
        let live = self.registry.list().into_iter().any(|m| m.id == id && m.state != Some(MountState::Discarded));
        if live {
            return Err(MountError::DestinationConflict(dir.to_path_buf()).into());
        }
        let staged = stage(source, path, dir)?;
        info!(source = %path.display(), dir = %staged.root().display(), "extracted archive");
        Ok(ExtractReport { root: staged.root().to_path_buf(), documents: staged.documents().present() })
    }

    pub fn mount(&self, path: &Path, destination: &Path) -> Result<MountId> {
        let source = self.open_source(path)?;
        Ok(self.registry.mount(source, path, destination)?)
    }

    fn resolve(&self, reference: &str) -> Result<MountId> {
        Ok(self.registry.resolve(reference)?)
    }

    pub fn fix_tokenizer(&self, reference: &str) -> Result<RepairReport> {
        let id = self.resolve(reference)?;
        let cfg = &self.config.tokenizer;
        self.registry.with_mount(&id, |m| fix_tokenizer(m, cfg).map_err(Error::from))
    }

    pub fn strip_telemetry(&self, reference: &str) -> Result<StripReport> {
        let id = self.resolve(reference)?;
        let patterns = &self.config.telemetry;
        self.registry.with_mount(&id, |m| strip_telemetry(m, patterns).map_err(Error::from))
    }

    pub fn transplant_tokenizer(&self, reference: &str, donor: &Path) -> Result<TransplantReport> {
        let id = self.resolve(reference)?;
        let donor = open_donor(donor, &self.config.parse_options())?;
        self.registry.with_mount(&id, |m| transplant_tokenizer(m, &donor).map_err(Error::from))
    }

    pub fn save(&self, reference: &str, output: &Path) -> Result<SaveReport> {
        let id = self.resolve(reference)?;
        self.registry.with_mount(&id, |m| repackager::save(m, output))
    }

    pub fn discard(&self, reference: &str) -> Result<MountId> {
        let id = self.resolve(reference)?;
        self.registry.discard(&id)?;
        Ok(id)
    }

    pub fn list(&self) -> Vec<MountInfo> {
        self.registry.list()
    }

    pub fn cleanup(&self, force: bool) -> Vec<MountId> {
        self.registry.cleanup(force)
    }
}

