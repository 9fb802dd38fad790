use std::io;
use std::path::PathBuf;

use ggufmount_codec::ParseError;
use ggufmount_stage::{DocumentError, MountError, MountId};
use thiserror::Error;

/// Errors from transformation passes.
///
/// A pass that finds nothing to change is not an error.
#[derive(Debug, Error)]
pub enum PassError {
    /// The mount (or donor archive) carries no tokenizer token list.
    #[error("no tokenizer present in {0}")]
    NoTokenizerPresent(String),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("cannot read donor archive {}: {source}", path.display())]
    DonorIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("donor archive {} is invalid: {source}", path.display())]
    DonorParse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

impl PassError {
    pub(crate) fn no_tokenizer(id: &MountId) -> Self {
        Self::NoTokenizerPresent(id.to_string())
    }
}

impl From<DocumentError> for PassError {
    fn from(e: DocumentError) -> Self {
        Self::Mount(MountError::Document(e))
    }
}
