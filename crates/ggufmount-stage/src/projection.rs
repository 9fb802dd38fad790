//! Which staged document a metadata key lives in.
//!
//! The same table drives staging and unstaging, so a key always returns to
//! the archive from the document it was projected into.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three staged documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Metadata,
    Config,
    Tokenizer,
}

impl DocumentKind {
    /// Merge order on unstage; later documents win.
    pub const MERGE_ORDER: [DocumentKind; 3] = [Self::Metadata, Self::Config, Self::Tokenizer];

    /// Path of the document relative to the mount root.
    pub const fn relative_path(self) -> &'static str {
        match self {
            Self::Metadata => "metadata/metadata.json",
            Self::Config => "config/model_config.json",
            Self::Tokenizer => "tokenizer/tokenizer.json",
        }
    }

    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Config => "config",
            Self::Tokenizer => "tokenizer",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How a rule matches a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    Prefix(&'static str),
    Exact(&'static str),
    /// `<general.architecture>.` prefix, resolved per archive.
    ArchitecturePrefix,
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionRule {
    pub matcher: KeyMatch,
    pub target: DocumentKind,
}

const fn rule(matcher: KeyMatch, target: DocumentKind) -> ProjectionRule {
    ProjectionRule { matcher, target }
}

/// First match wins; keys matching nothing go to [`DocumentKind::Metadata`].
pub const PROJECTION: &[ProjectionRule] = &[
    rule(KeyMatch::Prefix("tokenizer."), DocumentKind::Tokenizer),
    rule(KeyMatch::Exact("general.architecture"), DocumentKind::Config),
    rule(KeyMatch::Exact("general.parameter_count"), DocumentKind::Config),
    rule(KeyMatch::Exact("general.quantization_version"), DocumentKind::Config),
    rule(KeyMatch::Exact("general.file_type"), DocumentKind::Config),
    rule(KeyMatch::Exact("general.alignment"), DocumentKind::Config),
    rule(KeyMatch::ArchitecturePrefix, DocumentKind::Config),
];

impl KeyMatch {
    fn matches(self, key: &str, architecture: Option<&str>) -> bool {
        match self {
            Self::Prefix(p) => key.starts_with(p),
            Self::Exact(e) => key == e,
            Self::ArchitecturePrefix => architecture
                .filter(|a| !a.is_empty())
                .and_then(|a| key.strip_prefix(a))
                .is_some_and(|rest| rest.starts_with('.')),
        }
    }
}

/// Document a key belongs in, given the archive's architecture (if any).
pub fn project(key: &str, architecture: Option<&str>) -> DocumentKind {
    PROJECTION
        .iter()
        .find(|r| r.matcher.matches(key, architecture))
        .map_or(DocumentKind::Metadata, |r| r.target)
}
