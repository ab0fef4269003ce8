//! Error taxonomy shared by the link graph, the adapters and the engines.

use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::models::{EntryId, LinkKey};

/// Errors that can occur while maintaining the link graph.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A link whose source and target are the same note.
    #[error("cannot link a note to itself: {0}")]
    SelfLink(EntryId),

    /// A link with the same identity key already exists. Not fatal.
    #[error("link already exists: {0}")]
    DuplicateLink(LinkKey),

    /// A relationship type outside the fixed set.
    #[error("unknown link type: {0}")]
    UnknownLinkType(String),

    /// Malformed or ambiguous frontmatter, or a malformed index document.
    #[error("structural parse error in {location}: {detail}")]
    StructuralParse { location: String, detail: String },

    /// Two or more notes would normalize to the same entry id.
    #[error("rename conflict: {new_id} would be claimed by {}", .claimants.join(", "))]
    RenameConflict {
        new_id: EntryId,
        claimants: Vec<String>,
    },

    /// A rename for this entry id is already in flight.
    #[error("rename already in flight for {0}")]
    RenameInFlight(EntryId),

    /// A note or document that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store unavailability that is worth retrying.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[source] io::Error),

    /// Permanent I/O failure.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Indexed cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// The cache could not be cleared and repopulated. Fatal for the run.
    #[error("cache rebuild failed: {0}")]
    CacheRebuildFailure(String),

    /// JSON or YAML encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LinkError {
    /// Returns `true` for errors that should be retried with backoff.
    ///
    /// Structural and validation errors are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::TransientIo(_) => true,
            LinkError::Cache(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Returns `true` for errors that abort a whole recovery run rather than a
    /// single note.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::RenameInFlight(_) | LinkError::CacheRebuildFailure(_)
        )
    }

    pub(crate) fn structural(location: impl Into<String>, detail: impl Into<String>) -> Self {
        LinkError::StructuralParse {
            location: location.into(),
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => LinkError::TransientIo(err),
            io::ErrorKind::NotFound => LinkError::NotFound(err.to_string()),
            _ => LinkError::Io(err),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for LinkError {
    fn from(err: serde_yaml::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}

/// A unit of work (one note, one link key, one document) that failed inside
/// an otherwise continuing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
    pub transient: bool,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, err: &LinkError) -> Self {
        Self {
            unit: unit.into(),
            error: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, LinkError>;
