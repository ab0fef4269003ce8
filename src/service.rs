use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{LinkError, Result, UnitFailure};
use crate::graph::LinkGraph;
use crate::library::{LibrarySnapshot, LoadedNote, StagedWrite, commit_writes};
use crate::models::{DEFAULT_CREATED_BY, EntryId, FrontmatterLink, Link, LinkKey, LinkType, Tombstone};
use crate::recovery::Exclusivity;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CachedLink, CommitRef, INDEX_FILE, LinkCache, LinkFilter, LinkIndexStore, NoteStore};
use crate::sync::write_index;

/// Explicit link operations across all three stores.
///
/// Frontmatter is written first and is the only part that can fail the
/// operation; the index and the cache are brought along afterwards and any
/// failure there is reported but does not undo the frontmatter change.
///
/// # Examples
///
/// ```
/// use weft::{Database, FsLibrary, LinkRequest, LinkService, LinkType};
/// use time::OffsetDateTime;
///
/// # fn main() -> anyhow::Result<()> {
/// let dir = tempfile::tempdir()?;
/// std::fs::create_dir_all(dir.path().join("concept"))?;
/// std::fs::write(dir.path().join("concept/a.md"), "---\nid: library.concept.a\n---\n")?;
/// std::fs::write(dir.path().join("concept/b.md"), "---\nid: library.concept.b\n---\n")?;
///
/// let library = FsLibrary::new(dir.path());
/// let db = Database::in_memory()?;
/// let service = LinkService::new(&library, &library, &db);
///
/// let request = LinkRequest::new("library.concept.a", "library.concept.b", LinkType::Related);
/// let outcome = service.link_notes(&request, OffsetDateTime::now_utc())?;
/// assert_eq!(outcome.commits.len(), 2);
/// assert_eq!(service.note_links(&"library.concept.b".into())?.outgoing.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct LinkService<'a> {
    notes: &'a dyn NoteStore,
    index: &'a dyn LinkIndexStore,
    cache: &'a dyn LinkCache,
    policy: RetryPolicy,
    exclusivity: Arc<Exclusivity>,
}

/// A link to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub source: EntryId,
    pub target: EntryId,
    pub link_type: LinkType,
    pub description: Option<String>,
    pub created_by: String,
}

impl LinkRequest {
    pub fn new(source: impl Into<EntryId>, target: impl Into<EntryId>, link_type: LinkType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            link_type,
            description: None,
            created_by: DEFAULT_CREATED_BY.to_string(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }
}

/// Result of a link or unlink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    /// Links added, or the keys of links removed, including mirrors.
    pub keys: Vec<LinkKey>,
    pub commits: Vec<CommitRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_commit: Option<CommitRef>,
    /// Index or cache updates that failed after the notes were written.
    pub failures: Vec<UnitFailure>,
}

/// Cache rows around one note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NoteLinks {
    pub outgoing: Vec<CachedLink>,
    pub incoming: Vec<CachedLink>,
}

impl<'a> LinkService<'a> {
    pub fn new(
        notes: &'a dyn NoteStore,
        index: &'a dyn LinkIndexStore,
        cache: &'a dyn LinkCache,
    ) -> Self {
        Self {
            notes,
            index,
            cache,
            policy: RetryPolicy::default(),
            exclusivity: Exclusivity::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_exclusivity(mut self, exclusivity: Arc<Exclusivity>) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    /// Creates a link, and its mirror for symmetric types.
    ///
    /// Both notes must exist. Self-links and links that already exist in
    /// either note's frontmatter are rejected before anything is written. If
    /// the mirror cannot be written the source note is restored.
    pub fn link_notes(&self, request: &LinkRequest, now: OffsetDateTime) -> Result<LinkOutcome> {
        if request.source == request.target {
            return Err(LinkError::SelfLink(request.source.clone()));
        }
        let _cache = self.exclusivity.cache_shared();
        self.ensure_not_renaming(&[&request.source, &request.target])?;
        let snapshot = self.load()?;
        let source = find_note(&snapshot, &request.source)?;
        let target = find_note(&snapshot, &request.target)?;

        let link = Link::builder(request.source.clone(), request.target.clone(), request.link_type)
            .maybe_description(request.description.clone())
            .created_at(now)
            .created_by(request.created_by.clone())
            .build();
        let mut declared = LinkGraph::from_links(source.note.links().into_iter().chain(target.note.links()));
        declared.add_link(link.clone())?;

        let mut added = vec![link.clone()];
        let mut writes = vec![with_entry(source, &link)?];
        if link.link_type.is_symmetric() {
            let mirror = link.mirrored();
            writes.push(with_entry(target, &mirror)?);
            added.push(mirror);
        }
        let commits = commit_writes(self.notes, &self.policy, &writes)?;
        tracing::info!(link = %link.key(), notes = commits.len(), "linked notes");

        let mut outcome = LinkOutcome {
            keys: added.iter().map(Link::key).collect(),
            commits,
            ..LinkOutcome::default()
        };
        self.update_index(&snapshot, &added, &[], now, &mut outcome);
        for link in &added {
            if let Err(e) = retry_with_backoff(&self.policy, "upsert_link", || self.cache.upsert_link(link)) {
                tracing::warn!(link = %link.key(), error = %e, "failed to cache link");
                outcome.failures.push(UnitFailure::new(link.key().to_string(), &e));
            }
        }
        Ok(outcome)
    }

    /// Removes a link, and its mirror for symmetric types, from frontmatter,
    /// the index and the cache, recording tombstones in both stores.
    ///
    /// Removing a link that does not exist is not an error.
    pub fn unlink_notes(
        &self,
        source: &EntryId,
        target: &EntryId,
        link_type: LinkType,
        now: OffsetDateTime,
    ) -> Result<LinkOutcome> {
        let _cache = self.exclusivity.cache_shared();
        self.ensure_not_renaming(&[source, target])?;
        let snapshot = self.load()?;
        find_note(&snapshot, source)?;

        let key = LinkKey::new(source.clone(), target.clone(), link_type);
        let mut keys = vec![key.clone()];
        if link_type.is_symmetric() {
            keys.push(key.mirror());
        }

        let mut writes = Vec::new();
        for key in &keys {
            let Some(owner) = snapshot.find_by_id(&key.source) else {
                continue;
            };
            if let Some(write) = without_entry(owner, key)? {
                writes.push(write);
            }
        }
        let commits = commit_writes(self.notes, &self.policy, &writes)?;
        tracing::info!(link = %key, notes = commits.len(), "unlinked notes");

        let mut outcome = LinkOutcome {
            keys: keys.clone(),
            commits,
            ..LinkOutcome::default()
        };
        self.update_index(&snapshot, &[], &keys, now, &mut outcome);
        for key in &keys {
            if let Err(e) = retry_with_backoff(&self.policy, "delete_link", || self.cache.delete_link(key, now)) {
                tracing::warn!(link = %key, error = %e, "failed to remove cached link");
                outcome.failures.push(UnitFailure::new(key.to_string(), &e));
            }
        }
        Ok(outcome)
    }

    /// Outgoing and incoming cache rows for `entry_id`.
    pub fn note_links(&self, entry_id: &EntryId) -> Result<NoteLinks> {
        let outgoing = retry_with_backoff(&self.policy, "list_links", || {
            self.cache.list_links(&LinkFilter::from_source(entry_id.clone()))
        })?;
        let incoming = retry_with_backoff(&self.policy, "list_links", || {
            self.cache.list_links(&LinkFilter::to_target(entry_id.clone()))
        })?;
        Ok(NoteLinks { outgoing, incoming })
    }

    fn ensure_not_renaming(&self, ids: &[&EntryId]) -> Result<()> {
        match ids.iter().find(|id| self.exclusivity.is_renaming(id)) {
            Some(busy) => Err(LinkError::RenameInFlight((*busy).clone())),
            None => Ok(()),
        }
    }

    fn load(&self) -> Result<LibrarySnapshot> {
        LibrarySnapshot::load(self.notes, self.index, &self.policy)
    }

    fn update_index(
        &self,
        snapshot: &LibrarySnapshot,
        added: &[Link],
        removed: &[LinkKey],
        now: OffsetDateTime,
        outcome: &mut LinkOutcome,
    ) {
        if let Some(detail) = &snapshot.index_error {
            outcome.failures.push(UnitFailure::new(
                INDEX_FILE,
                &LinkError::structural(INDEX_FILE, detail.clone()),
            ));
            return;
        }

        let previous = snapshot.index.clone().unwrap_or_default();
        let mut links = previous.links_by_key();
        let mut deletions = previous.deletions_by_key();
        for link in added {
            deletions.remove(&link.key());
            links.insert(link.key(), link.clone());
        }
        for key in removed {
            links.remove(key);
            deletions.insert(key.clone(), Tombstone::new(key.clone(), now));
        }

        match write_index(
            self.index,
            &self.policy,
            snapshot,
            links.into_values().collect(),
            deletions.into_values().collect(),
            now,
        ) {
            Ok(commit) => outcome.index_commit = commit,
            Err(e) => {
                tracing::warn!(error = %e, "failed to update link index");
                outcome.failures.push(UnitFailure::new(INDEX_FILE, &e));
            }
        }
    }
}

fn find_note<'s>(snapshot: &'s LibrarySnapshot, id: &EntryId) -> Result<&'s LoadedNote> {
    snapshot
        .find_by_id(id)
        .ok_or_else(|| LinkError::NotFound(id.to_string()))
}

/// The note rewritten with `link` appended to its frontmatter links.
fn with_entry(owner: &LoadedNote, link: &Link) -> Result<StagedWrite> {
    let mut entries = owner.note.outgoing_links.clone();
    entries.push(FrontmatterLink::from_link(link));
    Ok(StagedWrite {
        location: owner.note.location.clone(),
        original: owner.raw.clone(),
        updated: owner.parsed.render_with_links(&entries)?,
    })
}

/// The note rewritten without the entry for `key`, or `None` if it has none.
fn without_entry(owner: &LoadedNote, key: &LinkKey) -> Result<Option<StagedWrite>> {
    let entries: Vec<FrontmatterLink> = owner
        .note
        .outgoing_links
        .iter()
        .filter(|entry| !entry.matches(&key.target, key.link_type))
        .cloned()
        .collect();
    if entries.len() == owner.note.outgoing_links.len() {
        return Ok(None);
    }
    Ok(Some(StagedWrite {
        location: owner.note.location.clone(),
        original: owner.raw.clone(),
        updated: owner.parsed.render_with_links(&entries)?,
    }))
}
