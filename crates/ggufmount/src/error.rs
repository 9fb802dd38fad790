//! Aggregate error type and its mapping to process exit codes.

use std::io;
use std::path::PathBuf;

use ggufmount_codec::{EncodeError, ParseError};
use ggufmount_passes::PassError;
use ggufmount_stage::{DocumentError, DocumentKind, MountError};
use thiserror::Error;

use crate::config::ConfigError;

/// Problems found in a mount's documents before anything is written.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("key '{key}' appears more than once in the {document} document")]
    DuplicateKey { document: DocumentKind, key: String },

    #[error("tokenizer key '{key}' is inconsistent: {reason}")]
    DanglingTokenizerIndex { key: String, reason: String },

    #[error("config key '{key}' is malformed: {reason}")]
    MalformedConfig { key: String, reason: String },

    #[error("refusing to overwrite the source archive {}", .0.display())]
    OutputIsSource(PathBuf),
}

/// Coarse error classes, one per exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Validation,
    MountBusy,
    DestinationConflict,
    Io,
    Mount,
    NoTokenizer,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Other => 1,
            Self::Parse => 2,
            Self::Validation => 3,
            Self::MountBusy => 4,
            Self::DestinationConflict => 5,
            Self::Io => 6,
            Self::Mount => 7,
            Self::NoTokenizer => 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Pass(#[from] PassError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Encode(EncodeError::Io(_)) => ErrorKind::Io,
            Self::Encode(_) => ErrorKind::Validation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Mount(e) => mount_kind(e),
            Self::Pass(PassError::NoTokenizerPresent(_)) => ErrorKind::NoTokenizer,
            Self::Pass(PassError::Mount(e)) => mount_kind(e),
            Self::Pass(PassError::DonorIo { .. }) => ErrorKind::Io,
            Self::Pass(PassError::DonorParse { .. }) => ErrorKind::Parse,
            Self::Config(_) => ErrorKind::Other,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

fn mount_kind(e: &MountError) -> ErrorKind {
    match e {
        MountError::MountBusy(_) => ErrorKind::MountBusy,
        MountError::DestinationConflict(_) => ErrorKind::DestinationConflict,
        MountError::Io { .. } | MountError::Document(DocumentError::Io { .. }) => ErrorKind::Io,
        // a hand-edited document that no longer decodes
        MountError::Document(DocumentError::Json { .. }) => ErrorKind::Validation,
        MountError::MountNotFound(_) | MountError::InvalidTransition { .. } => ErrorKind::Mount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggufmount_stage::MountId;

    #[test]
    fn exit_codes_follow_the_error_class() {
        let busy = Error::from(MountError::MountBusy(MountId::from_raw("/m")));
        assert_eq!(busy.exit_code(), 4);

        let conflict = Error::from(PassError::Mount(MountError::DestinationConflict("/m".into())));
        assert_eq!(conflict.exit_code(), 5);

        let missing = Error::from(MountError::MountNotFound("x".into()));
        assert_eq!(missing.exit_code(), 7);

        let no_tok = Error::from(PassError::NoTokenizerPresent("x".into()));
        assert_eq!(no_tok.exit_code(), 8);

        let parse = Error::Parse { path: "a.gguf".into(), source: ParseError::MagicMismatch { found: *b"ABCD" } };
        assert_eq!(parse.exit_code(), 2);

        let invalid = Error::from(ValidationError::OutputIsSource("a.gguf".into()));
        assert_eq!(invalid.exit_code(), 3);
        assert_eq!(Error::io("a", io::Error::other("boom")).exit_code(), 6);
    }
}
