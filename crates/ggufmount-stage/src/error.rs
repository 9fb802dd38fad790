use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::mount::{MountId, MountState};

/// Failure reading or writing one staged JSON file.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed staged document {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DocumentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json { path: path.into(), source }
    }
}

/// Errors from staging and the mount registry. All are recoverable: the
/// registry and the source archive are left as they were.
#[derive(Debug, Error)]
pub enum MountError {
    /// The destination already holds a registered, live mount, or another
    /// caller is staging one there.
    #[error("destination {} is already mounted", .0.display())]
    DestinationConflict(PathBuf),

    /// Another operation holds this mount.
    #[error("mount {0} is busy")]
    MountBusy(MountId),

    #[error("no mount registered as {0}")]
    MountNotFound(String),

    #[error("mount {id} cannot move from {from} to {to}")]
    InvalidTransition { id: MountId, from: MountState, to: MountState },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MountError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T, E = MountError> = std::result::Result<T, E>;
