//! Adapter interfaces for the authoritative store and the indexed cache.
//!
//! The engines only ever talk to these traits. Every call is a suspension
//! point that may fail transiently and is wrapped in
//! [`retry_with_backoff`](crate::retry::retry_with_backoff) by the caller.

mod library;

pub use library::{FsLibrary, INDEX_FILE};

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::error::Result;
use crate::models::{EntryId, Link, LinkIndex, LinkKey, LinkType, NoteLocation, Tombstone};

/// Reference to a committed write in the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(pub String);

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads and writes individual note files.
///
/// Notes are addressed by location because the entry id lives inside the
/// file and may itself be legacy or malformed.
pub trait NoteStore {
    fn list_notes(&self) -> Result<Vec<NoteLocation>>;

    /// Raw file contents. Missing notes are [`LinkError::NotFound`](crate::LinkError::NotFound).
    fn read_note(&self, location: &NoteLocation) -> Result<String>;

    /// Replaces the whole file in one atomic commit.
    fn write_note(&self, location: &NoteLocation, contents: &str) -> Result<CommitRef>;
}

/// Reads and writes the repository-wide link index document.
pub trait LinkIndexStore {
    /// `None` when no index has been written yet.
    fn read_index(&self) -> Result<Option<LinkIndex>>;

    fn write_index(&self, index: &LinkIndex) -> Result<CommitRef>;
}

/// Optional constraints for [`LinkCache::list_links`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkFilter {
    pub source: Option<EntryId>,
    pub target: Option<EntryId>,
    pub link_type: Option<LinkType>,
}

impl LinkFilter {
    pub fn from_source(source: EntryId) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn to_target(target: EntryId) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

/// A link row as stored in the cache, with its cache-local id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLink {
    pub id: i64,
    #[serde(flatten)]
    pub link: Link,
}

/// Fast queryable projection of the links.
pub trait LinkCache {
    /// Inserts or updates the row for the link's key.
    fn upsert_link(&self, link: &Link) -> Result<()>;

    /// Removes the row and records a tombstone. Returns whether a row existed.
    fn delete_link(&self, key: &LinkKey, deleted_at: OffsetDateTime) -> Result<bool>;

    /// Rows ordered by key.
    fn list_links(&self, filter: &LinkFilter) -> Result<Vec<CachedLink>>;

    /// Removes every row and tombstone.
    fn clear_all(&self) -> Result<()>;

    /// Clears and repopulates with `links` as one atomic swap. On failure the
    /// previous content is left untouched.
    fn replace_all(&self, links: &[Link]) -> Result<usize>;

    /// Rewrites every row touching `old` to reference `new`.
    fn rename_entry(&self, old: &EntryId, new: &EntryId) -> Result<usize>;

    fn tombstones(&self) -> Result<Vec<Tombstone>>;

    fn mark_synced(&self, entry_id: &EntryId, at: OffsetDateTime) -> Result<()>;

    fn last_synced(&self, entry_id: &EntryId) -> Result<Option<OffsetDateTime>>;
}
