//! Point-in-time view of the authoritative store.

use std::collections::BTreeSet;

use crate::error::{LinkError, Result};
use crate::frontmatter::ParsedNote;
use crate::models::{EntryId, Link, LinkIndex, Note, NoteLocation};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommitRef, LinkIndexStore, NoteStore};

/// A note that parsed into a structural view.
#[derive(Debug, Clone)]
pub struct LoadedNote {
    pub note: Note,
    pub raw: String,
    pub parsed: ParsedNote,
}

/// A note whose frontmatter could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedNote {
    pub location: NoteLocation,
    pub raw: String,
    pub detail: String,
}

/// A note that could not be read after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFailure {
    pub location: NoteLocation,
    pub error: String,
}

/// Every note and the link index, read once.
#[derive(Debug, Clone, Default)]
pub struct LibrarySnapshot {
    /// Parsed notes in location order.
    pub notes: Vec<LoadedNote>,
    pub malformed: Vec<MalformedNote>,
    pub read_failures: Vec<ReadFailure>,
    /// `None` when the index has never been written or is malformed.
    pub index: Option<LinkIndex>,
    /// Parse error of the index document, if any.
    pub index_error: Option<String>,
}

impl LibrarySnapshot {
    /// Lists, reads and parses every note, then reads the link index.
    ///
    /// Per-note read and parse failures are collected rather than returned;
    /// only a failure to list the notes aborts the load.
    pub fn load(
        notes: &dyn NoteStore,
        index: &dyn LinkIndexStore,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        let locations = retry_with_backoff(policy, "list_notes", || notes.list_notes())?;
        let mut snapshot = Self::default();

        for location in locations {
            let raw = match retry_with_backoff(policy, "read_note", || notes.read_note(&location)) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(note = %location, error = %e, "failed to read note");
                    snapshot.read_failures.push(ReadFailure {
                        location,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match parse_note(&location, &raw) {
                Ok((note, parsed)) => snapshot.notes.push(LoadedNote { note, raw, parsed }),
                Err(e) => {
                    tracing::debug!(note = %location, error = %e, "malformed note");
                    snapshot.malformed.push(MalformedNote {
                        location,
                        raw,
                        detail: structural_detail(&e),
                    });
                }
            }
        }

        match retry_with_backoff(policy, "read_index", || index.read_index()) {
            Ok(found) => snapshot.index = found,
            Err(e @ LinkError::StructuralParse { .. }) => {
                tracing::warn!(error = %e, "link index is malformed");
                snapshot.index_error = Some(structural_detail(&e));
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(
            notes = snapshot.notes.len(),
            malformed = snapshot.malformed.len(),
            unreadable = snapshot.read_failures.len(),
            "loaded library snapshot"
        );
        Ok(snapshot)
    }

    /// Loads a single note by location.
    pub fn load_note(
        notes: &dyn NoteStore,
        location: &NoteLocation,
        policy: &RetryPolicy,
    ) -> Result<LoadedNote> {
        let raw = retry_with_backoff(policy, "read_note", || notes.read_note(location))?;
        let (note, parsed) = parse_note(location, &raw)?;
        Ok(LoadedNote { note, raw, parsed })
    }

    /// Ids of every parsed note.
    pub fn entry_ids(&self) -> BTreeSet<EntryId> {
        self.notes
            .iter()
            .filter_map(|loaded| loaded.note.entry_id.clone())
            .collect()
    }

    /// Links declared in frontmatter across all notes, in location order.
    pub fn frontmatter_links(&self) -> Vec<Link> {
        self.notes
            .iter()
            .flat_map(|loaded| loaded.note.links())
            .collect()
    }

    pub fn index_links(&self) -> &[Link] {
        self.index.as_ref().map(|i| i.links.as_slice()).unwrap_or(&[])
    }

    /// First note carrying `id`.
    pub fn find_by_id(&self, id: &EntryId) -> Option<&LoadedNote> {
        self.notes
            .iter()
            .find(|loaded| loaded.note.entry_id.as_ref() == Some(id))
    }

    pub fn find_by_location(&self, location: &NoteLocation) -> Option<&LoadedNote> {
        self.notes
            .iter()
            .find(|loaded| &loaded.note.location == location)
    }

    pub fn note_count(&self) -> usize {
        self.notes.len() + self.malformed.len() + self.read_failures.len()
    }
}

/// A whole-file note rewrite that can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedWrite {
    pub location: NoteLocation,
    pub original: String,
    pub updated: String,
}

/// Writes each staged note in order. If one fails, the notes already written
/// are restored, newest first, and the error is returned.
pub(crate) fn commit_writes(
    notes: &dyn NoteStore,
    policy: &RetryPolicy,
    writes: &[StagedWrite],
) -> Result<Vec<CommitRef>> {
    let mut commits = Vec::with_capacity(writes.len());
    for (i, write) in writes.iter().enumerate() {
        match retry_with_backoff(policy, "write_note", || {
            notes.write_note(&write.location, &write.updated)
        }) {
            Ok(commit) => commits.push(commit),
            Err(e) => {
                tracing::warn!(note = %write.location, error = %e, "note write failed, restoring earlier writes");
                restore_writes(notes, policy, &writes[..i]);
                return Err(e);
            }
        }
    }
    Ok(commits)
}

/// Puts the original contents back, newest write first. Failures are logged.
pub(crate) fn restore_writes(notes: &dyn NoteStore, policy: &RetryPolicy, written: &[StagedWrite]) {
    for write in written.iter().rev() {
        if let Err(e) = retry_with_backoff(policy, "write_note", || {
            notes.write_note(&write.location, &write.original)
        }) {
            tracing::error!(note = %write.location, error = %e, "failed to restore note");
        }
    }
}

fn parse_note(location: &NoteLocation, raw: &str) -> Result<(Note, ParsedNote)> {
    let parsed = ParsedNote::parse(location.as_str(), raw)?;
    let note = Note::from_frontmatter(location.clone(), &parsed.merged())?;
    Ok((note, parsed))
}

fn structural_detail(err: &LinkError) -> String {
    match err {
        LinkError::StructuralParse { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}
