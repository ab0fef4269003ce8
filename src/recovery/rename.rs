//! Renaming an entry id together with every reference to it.
//!
//! A rename touches the note itself, every note whose frontmatter links to
//! the old id, the link index and the cache. All writes are staged up front
//! from freshly read contents, committed in that order, and undone in reverse
//! if any of them fails.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use time::OffsetDateTime;

use crate::error::{LinkError, Result};
use crate::frontmatter::render_blocks;
use crate::graph::{MOST_LINKED_LIMIT, compute_stats};
use crate::library::{LibrarySnapshot, StagedWrite, commit_writes, restore_writes};
use crate::models::{
    ALT_ID_KEY, EntryId, FrontmatterLink, ID_KEY, Link, LinkIndex, LinkKey, NoteLocation, Tombstone,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommitRef, LinkCache, LinkIndexStore, NoteStore};

/// A rename decided by `normalize_ids`, before anything is read or written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenamePlan {
    pub location: NoteLocation,
    /// `None` for a note that had no id at all.
    pub old: Option<EntryId>,
    pub new: EntryId,
    /// Notes whose frontmatter links target `old`.
    pub referrers: Vec<NoteLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameState {
    Staged,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
struct IndexUpdate {
    previous: LinkIndex,
    next: LinkIndex,
}

/// Every write of one rename, staged and not yet applied.
#[derive(Debug)]
pub struct RenameTransaction {
    plan: RenamePlan,
    /// The renamed note first, then its referrers.
    writes: Vec<StagedWrite>,
    index: Option<IndexUpdate>,
    state: RenameState,
}

impl RenameTransaction {
    /// Reads the note and its referrers and prepares their rewritten contents.
    ///
    /// `index` is the current index document, if there is a readable one, and
    /// `known_ids` the ids of every note before the rename.
    pub fn stage(
        plan: RenamePlan,
        notes: &dyn NoteStore,
        policy: &RetryPolicy,
        index: Option<&LinkIndex>,
        known_ids: &BTreeSet<EntryId>,
        now: OffsetDateTime,
    ) -> Result<Self> {
        let loaded = LibrarySnapshot::load_note(notes, &plan.location, policy)?;
        if loaded.note.entry_id != plan.old {
            return Err(LinkError::structural(
                plan.location.as_str(),
                "entry id changed since the rename was planned",
            ));
        }
        let mut blocks = loaded.parsed.blocks.clone();
        set_entry_id(&mut blocks, &plan.new);
        let mut writes = vec![StagedWrite {
            location: plan.location.clone(),
            updated: render_blocks(&blocks, &loaded.parsed.body)?,
            original: loaded.raw,
        }];

        let mut index_update = None;
        if let Some(old) = &plan.old {
            for location in &plan.referrers {
                if let Some(write) = stage_referrer(notes, policy, location, old, &plan.new)? {
                    writes.push(write);
                }
            }
            if let Some(previous) = index {
                let mut ids = known_ids.clone();
                ids.remove(old);
                ids.insert(plan.new.clone());
                index_update = rename_in_index(previous, old, &plan.new, &ids, now);
            }
        }

        Ok(Self {
            plan,
            writes,
            index: index_update,
            state: RenameState::Staged,
        })
    }

    pub fn plan(&self) -> &RenamePlan {
        &self.plan
    }

    pub fn state(&self) -> RenameState {
        self.state
    }

    /// Number of referring notes that will be rewritten.
    pub fn referrer_count(&self) -> usize {
        self.writes.len() - 1
    }

    /// The index document written on commit, if the index changes.
    pub fn staged_index(&self) -> Option<&LinkIndex> {
        self.index.as_ref().map(|update| &update.next)
    }

    /// Applies every staged write. On any failure the writes already made are
    /// reverted and the error is returned.
    pub fn commit(
        &mut self,
        notes: &dyn NoteStore,
        index: &dyn LinkIndexStore,
        cache: &dyn LinkCache,
        policy: &RetryPolicy,
    ) -> Result<Vec<CommitRef>> {
        if self.state != RenameState::Staged {
            return Err(LinkError::structural(
                self.plan.location.as_str(),
                format!("rename transaction is already {:?}", self.state),
            ));
        }
        let result = self.apply(notes, index, cache, policy);
        self.state = match result {
            Ok(_) => RenameState::Committed,
            Err(_) => RenameState::RolledBack,
        };
        result
    }

    fn apply(
        &self,
        notes: &dyn NoteStore,
        index: &dyn LinkIndexStore,
        cache: &dyn LinkCache,
        policy: &RetryPolicy,
    ) -> Result<Vec<CommitRef>> {
        let commits = commit_writes(notes, policy, &self.writes)?;

        if let Some(update) = &self.index
            && let Err(e) = retry_with_backoff(policy, "write_index", || index.write_index(&update.next))
        {
            tracing::warn!(error = %e, "rename index write failed, rolling back");
            restore_writes(notes, policy, &self.writes);
            return Err(e);
        }

        if let Some(old) = &self.plan.old
            && let Err(e) = retry_with_backoff(policy, "rename_entry", || cache.rename_entry(old, &self.plan.new))
        {
            tracing::warn!(error = %e, "rename cache update failed, rolling back");
            if let Some(update) = &self.index
                && let Err(restore) =
                    retry_with_backoff(policy, "write_index", || index.write_index(&update.previous))
            {
                tracing::error!(error = %restore, "failed to restore link index");
            }
            restore_writes(notes, policy, &self.writes);
            return Err(e);
        }

        Ok(commits)
    }
}

/// Sets the id in whichever block already names it, else the first block.
fn set_entry_id(blocks: &mut Vec<Mapping>, id: &EntryId) {
    if blocks.is_empty() {
        blocks.push(Mapping::new());
    }
    let position = |key: &str| blocks.iter().position(|block| block.contains_key(key));
    let (index, key) = match (position(ID_KEY), position(ALT_ID_KEY)) {
        (Some(i), _) => (i, ID_KEY),
        (None, Some(i)) => (i, ALT_ID_KEY),
        (None, None) => (0, ID_KEY),
    };
    blocks[index].insert(
        Value::String(key.to_string()),
        Value::String(id.as_str().to_string()),
    );
}

fn stage_referrer(
    notes: &dyn NoteStore,
    policy: &RetryPolicy,
    location: &NoteLocation,
    old: &EntryId,
    new: &EntryId,
) -> Result<Option<StagedWrite>> {
    let loaded = LibrarySnapshot::load_note(notes, location, policy)?;
    if !loaded.note.outgoing_links.iter().any(|entry| &entry.target == old) {
        return Ok(None);
    }

    let mut seen = BTreeSet::new();
    let entries: Vec<FrontmatterLink> = loaded
        .note
        .outgoing_links
        .iter()
        .map(|entry| {
            let mut entry = entry.clone();
            if &entry.target == old {
                entry.target = new.clone();
            }
            entry
        })
        .filter(|entry| seen.insert((entry.target.clone(), entry.link_type)))
        .collect();

    Ok(Some(StagedWrite {
        location: location.clone(),
        updated: loaded.parsed.render_with_links(&entries)?,
        original: loaded.raw,
    }))
}

/// The index with `old` replaced by `new`, or `None` when nothing changes.
fn rename_in_index(
    previous: &LinkIndex,
    old: &EntryId,
    new: &EntryId,
    known_ids: &BTreeSet<EntryId>,
    now: OffsetDateTime,
) -> Option<IndexUpdate> {
    let touched = previous.links.iter().any(|link| link.key().touches(old))
        || previous.deletions.iter().any(|tomb| tomb.key.touches(old));
    if !touched {
        return None;
    }

    let mut links = BTreeMap::new();
    for link in previous.links_by_key().into_values() {
        let link = link.renamed(old, new);
        if link.is_self_link() {
            continue;
        }
        let key = link.key();
        let merged = match links.remove(&key) {
            Some(existing) => Link::newer_of(existing, link),
            None => link,
        };
        links.insert(key, merged);
    }

    let mut deletions: BTreeMap<LinkKey, Tombstone> = BTreeMap::new();
    for tomb in previous.deletions_by_key().into_values() {
        let key = tomb.key.renamed(old, new);
        if key.source == key.target || links.contains_key(&key) {
            continue;
        }
        if deletions
            .get(&key)
            .is_none_or(|existing| tomb.deleted_at > existing.deleted_at)
        {
            deletions.insert(key.clone(), Tombstone::new(key, tomb.deleted_at));
        }
    }

    let links: Vec<_> = links.into_values().collect();
    let mut next = LinkIndex {
        stats: compute_stats(&links, known_ids, MOST_LINKED_LIMIT),
        links,
        deletions: deletions.into_values().collect(),
        ..previous.clone()
    };
    next.touch(now);
    Some(IndexUpdate {
        previous: previous.clone(),
        next,
    })
}
