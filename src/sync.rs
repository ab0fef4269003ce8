//! Two-way reconciliation between the authoritative store and the cache.
//!
//! Push (authoritative → cache) is a keyed lattice merge: every key ends up
//! with the newest version seen on either side, so batching and ordering do
//! not change the outcome. Pull (cache → authoritative) applies the conflict
//! policy: the later `created_at` wins, equal timestamps with different
//! content are reported and left alone, and deletions propagate only inside
//! the freshness window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{LinkError, Result, UnitFailure};
use crate::graph::{MOST_LINKED_LIMIT, compute_stats, expand_symmetric};
use crate::library::{LibrarySnapshot, LoadedNote};
use crate::models::{
    EntryId, FrontmatterLink, INDEX_VERSION, Link, LinkIndex, LinkKey, LinkType, Note,
    NoteLocation, Tombstone,
};
use crate::recovery::Exclusivity;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommitRef, INDEX_FILE, LinkCache, LinkFilter, LinkIndexStore, NoteStore};

/// How long a recorded deletion is trusted enough to propagate.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::hours(24);

/// Which link types a push covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeSelection {
    #[default]
    All,
    /// `implements` and `blocks`, pushed as notes change.
    Critical,
    /// Everything else, pushed on the periodic full scan.
    Routine,
}

impl TypeSelection {
    pub fn includes(self, link_type: LinkType) -> bool {
        match self {
            TypeSelection::All => true,
            TypeSelection::Critical => link_type.is_critical(),
            TypeSelection::Routine => !link_type.is_critical(),
        }
    }
}

/// Which notes a push reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncScope {
    #[default]
    All,
    Note(NoteLocation),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushRequest {
    pub scope: SyncScope,
    pub types: TypeSelection,
}

impl PushRequest {
    pub fn full_scan() -> Self {
        Self::default()
    }

    pub fn note(location: NoteLocation) -> Self {
        Self {
            scope: SyncScope::Note(location),
            ..Self::default()
        }
    }

    pub fn types(mut self, types: TypeSelection) -> Self {
        self.types = types;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides carry the key with the same `created_at` but different content.
    EqualTimestamps,
    /// One side deleted the key longer ago than the freshness window.
    StaleDeletion,
}

/// A disagreement that is reported and never resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub key: LinkKey,
    pub kind: ConflictKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<Link>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

/// Outcome of one push or pull run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub notes_scanned: usize,
    pub links_considered: usize,
    pub cache_upserts: usize,
    pub cache_deletes: usize,
    /// Keys held back because the cache deleted them after they were created.
    pub deferred: usize,
    /// Notes skipped because an id they touch is being renamed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deferred_notes: Vec<NoteLocation>,
    pub notes_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_commit: Option<CommitRef>,
    pub conflicts: Vec<ConflictRecord>,
    pub failures: Vec<UnitFailure>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Result of merging two link sets under the conflict policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merged links in key order. Conflicting keys are absent.
    pub links: Vec<Link>,
    pub conflicts: BTreeSet<LinkKey>,
}

/// Merges two link sets by key.
///
/// Keys on one side only are kept; keys on both sides keep the later
/// `created_at`; equal timestamps with different content are conflicts.
/// The result does not depend on argument order.
pub fn merge_link_sets(left: &[Link], right: &[Link]) -> MergeOutcome {
    let left = keyed(left.iter().cloned());
    let right = keyed(right.iter().cloned());
    let mut outcome = MergeOutcome::default();

    let keys: BTreeSet<&LinkKey> = left.keys().chain(right.keys()).collect();
    for key in keys {
        let merged = match (left.get(key), right.get(key)) {
            (Some(a), Some(b)) => resolve(a, b),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        };
        match merged {
            Some(link) => outcome.links.push(link),
            None => {
                outcome.conflicts.insert(key.clone());
            }
        }
    }
    outcome
}

/// Per-key decisions of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullPlan {
    /// Version each key should carry on both sides.
    pub resolved: BTreeMap<LinkKey, Link>,
    /// Keys to delete from both sides.
    pub deletions: BTreeMap<LinkKey, Tombstone>,
    pub conflicts: Vec<ConflictRecord>,
}

impl PullPlan {
    fn is_conflicted(&self, key: &LinkKey) -> bool {
        self.conflicts.iter().any(|c| &c.key == key)
    }
}

/// Decides what a pull does for every key present on either side.
///
/// `authoritative_deletions` and `cache_deletions` are the tombstones each
/// side recorded; a tombstone only counts when it is not older than the
/// version on the other side.
pub fn plan_pull(
    authoritative: &BTreeMap<LinkKey, Link>,
    cache: &BTreeMap<LinkKey, Link>,
    authoritative_deletions: &BTreeMap<LinkKey, Tombstone>,
    cache_deletions: &BTreeMap<LinkKey, Tombstone>,
    now: OffsetDateTime,
    window: Duration,
) -> PullPlan {
    let mut plan = PullPlan::default();
    let keys: BTreeSet<&LinkKey> = authoritative.keys().chain(cache.keys()).collect();

    for key in keys {
        let auth = authoritative.get(key);
        let cached = cache.get(key);
        let conflict = |kind, deleted_at| ConflictRecord {
            key: key.clone(),
            kind,
            authoritative: auth.cloned(),
            cache: cached.cloned(),
            deleted_at,
            detected_at: now,
        };

        match (auth, cached) {
            (Some(a), Some(c)) => match resolve(a, c) {
                Some(link) => {
                    plan.resolved.insert(key.clone(), link);
                }
                None => plan.conflicts.push(conflict(ConflictKind::EqualTimestamps, None)),
            },
            (Some(present), None) | (None, Some(present)) => {
                let deletions = if auth.is_some() {
                    cache_deletions
                } else {
                    authoritative_deletions
                };
                match deletions.get(key).filter(|t| t.deleted_at >= present.created_at) {
                    None => {
                        plan.resolved.insert(key.clone(), present.clone());
                    }
                    Some(tomb) if is_fresh(tomb, now, window) => {
                        plan.deletions.insert(key.clone(), tomb.clone());
                    }
                    Some(tomb) => plan
                        .conflicts
                        .push(conflict(ConflictKind::StaleDeletion, Some(tomb.deleted_at))),
                }
            }
            (None, None) => {}
        }
    }

    pair_symmetric(&mut plan);
    plan
}

/// Keeps symmetric pairs together: a deletion takes its mirror with it, a
/// conflict holds its mirror back, and a surviving link gets its mirror.
fn pair_symmetric(plan: &mut PullPlan) {
    let deleted: Vec<(LinkKey, Tombstone)> = plan
        .deletions
        .iter()
        .filter(|(key, _)| key.link_type.is_symmetric())
        .map(|(key, tomb)| (key.mirror(), tomb.clone()))
        .collect();
    for (mirror, tomb) in deleted {
        if plan.is_conflicted(&mirror) || plan.deletions.contains_key(&mirror) {
            continue;
        }
        plan.resolved.remove(&mirror);
        plan.deletions
            .insert(mirror.clone(), Tombstone::new(mirror, tomb.deleted_at));
    }

    let held: Vec<LinkKey> = plan
        .conflicts
        .iter()
        .filter(|c| c.key.link_type.is_symmetric())
        .map(|c| c.key.mirror())
        .collect();
    for mirror in held {
        plan.resolved.remove(&mirror);
    }

    let missing: Vec<Link> = plan
        .resolved
        .iter()
        .filter(|(key, _)| {
            let mirror = key.mirror();
            key.link_type.is_symmetric()
                && !plan.resolved.contains_key(&mirror)
                && !plan.deletions.contains_key(&mirror)
                && !plan.is_conflicted(&mirror)
        })
        .map(|(_, link)| link.mirrored())
        .collect();
    for mirror in missing {
        plan.resolved.insert(mirror.key(), mirror);
    }
}

/// Reconciles one authoritative store with one cache.
pub struct SyncEngine<'a> {
    notes: &'a dyn NoteStore,
    index: &'a dyn LinkIndexStore,
    cache: &'a dyn LinkCache,
    policy: RetryPolicy,
    freshness_window: Duration,
    exclusivity: Arc<Exclusivity>,
}

impl<'a> SyncEngine<'a> {
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
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            exclusivity: Exclusivity::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Shares rename claims and the cache lock with other engines.
    pub fn with_exclusivity(mut self, exclusivity: Arc<Exclusivity>) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    /// Propagates frontmatter links to the cache and merges them into the
    /// link index.
    ///
    /// Never deletes and never replaces a cache row with an older version.
    /// A failure while pushing one note is recorded and the run continues.
    /// Notes touching an id under rename are deferred to a later push.
    pub fn push_to_cache(&self, request: &PushRequest, now: OffsetDateTime) -> Result<SyncReport> {
        let _cache = self.exclusivity.cache_shared();
        let snapshot = LibrarySnapshot::load(self.notes, self.index, &self.policy)?;
        let sources: Vec<&LoadedNote> = match &request.scope {
            SyncScope::All => snapshot.notes.iter().collect(),
            SyncScope::Note(location) => vec![scoped_note(&snapshot, location)?],
        };

        let mut report = SyncReport {
            notes_scanned: sources.len(),
            ..SyncReport::default()
        };
        let mut cache = keyed(self.list_cache()?);
        let cache_deletions = self.cache_tombstones()?;
        let mut pushed: BTreeMap<LinkKey, Link> = BTreeMap::new();

        for loaded in sources {
            let Some(id) = &loaded.note.entry_id else {
                tracing::debug!(note = %loaded.note.location, "note has no id, skipping");
                continue;
            };
            if let Some(busy) = self.renaming_in(&loaded.note) {
                tracing::info!(note = %loaded.note.location, entry = %busy, "rename in flight, deferring note");
                report.deferred_notes.push(loaded.note.location.clone());
                continue;
            }
            let links = with_mirrors(
                loaded
                    .note
                    .links()
                    .into_iter()
                    .filter(|link| request.types.includes(link.link_type)),
            );
            report.links_considered += links.len();

            let pushed_note = self
                .push_links(&links, &mut cache, &cache_deletions, &mut report)
                .and_then(|()| {
                    retry_with_backoff(&self.policy, "mark_synced", || {
                        self.cache.mark_synced(id, now)
                    })
                });
            if let Err(e) = pushed_note {
                tracing::warn!(note = %loaded.note.location, error = %e, "push failed for note");
                report
                    .failures
                    .push(UnitFailure::new(loaded.note.location.as_str(), &e));
            }

            for link in links {
                merge_into(&mut pushed, link);
            }
        }

        match &snapshot.index_error {
            Some(detail) => report.failures.push(UnitFailure::new(
                INDEX_FILE,
                &LinkError::structural(INDEX_FILE, detail.clone()),
            )),
            None => {
                let previous = snapshot.index.clone().unwrap_or_default();
                let mut links = previous.links_by_key();
                let mut deletions = previous.deletions_by_key();
                for (key, link) in pushed {
                    deletions.remove(&key);
                    merge_into(&mut links, link);
                }
                self.write_index_if_changed(&snapshot, links, deletions, now, &mut report);
            }
        }

        tracing::info!(
            notes = report.notes_scanned,
            upserts = report.cache_upserts,
            deferred = report.deferred,
            failures = report.failures.len(),
            "push complete"
        );
        Ok(report)
    }

    /// Reconciles the cache back into note frontmatter and the link index.
    ///
    /// Every note is rewritten in one atomic commit; a failed note leaves its
    /// keys untouched in the index and does not stop the other notes.
    ///
    /// Refuses to run while a rename touches any note or planned link.
    pub fn pull_from_cache(&self, now: OffsetDateTime) -> Result<SyncReport> {
        let _cache = self.exclusivity.cache_shared();
        let snapshot = LibrarySnapshot::load(self.notes, self.index, &self.policy)?;
        let mut report = SyncReport {
            notes_scanned: snapshot.notes.len(),
            ..SyncReport::default()
        };

        let mut declared = snapshot.frontmatter_links();
        declared.extend(snapshot.index_links().iter().cloned());
        let authoritative = keyed(expand_symmetric(&declared));
        let cache_rows = self.list_cache()?;
        let cache_deletions = self.cache_tombstones()?;
        let cache = keyed(cache_rows.iter().cloned());
        let cache_view = mirrored_view(&cache_rows, &cache_deletions);
        let authoritative_deletions = snapshot
            .index
            .as_ref()
            .map(LinkIndex::deletions_by_key)
            .unwrap_or_default();

        let plan = plan_pull(
            &authoritative,
            &cache_view,
            &authoritative_deletions,
            &cache_deletions,
            now,
            self.freshness_window,
        );
        let mut touched = snapshot.entry_ids();
        for key in plan.resolved.keys().chain(plan.deletions.keys()) {
            touched.insert(key.source.clone());
            touched.insert(key.target.clone());
        }
        if let Some(busy) = touched.into_iter().find(|id| self.exclusivity.is_renaming(id)) {
            return Err(LinkError::RenameInFlight(busy));
        }

        report.links_considered = plan.resolved.len() + plan.deletions.len() + plan.conflicts.len();
        for conflict in &plan.conflicts {
            tracing::warn!(link = %conflict.key, kind = ?conflict.kind, "sync conflict");
        }
        report.conflicts = plan.conflicts.clone();

        let failed_keys = self.apply_to_notes(&snapshot, &plan, &mut report);
        match &snapshot.index_error {
            Some(detail) => report.failures.push(UnitFailure::new(
                INDEX_FILE,
                &LinkError::structural(INDEX_FILE, detail.clone()),
            )),
            None => self.apply_to_index(&snapshot, &plan, &failed_keys, now, &mut report),
        }
        self.apply_to_cache(&cache, &plan, &mut report);

        tracing::info!(
            notes_written = report.notes_written,
            upserts = report.cache_upserts,
            deletes = report.cache_deletes,
            conflicts = report.conflicts.len(),
            failures = report.failures.len(),
            "pull complete"
        );
        Ok(report)
    }

    /// An id of `note` or of one of its link targets that is being renamed.
    fn renaming_in(&self, note: &Note) -> Option<EntryId> {
        note.entry_id
            .iter()
            .chain(note.outgoing_links.iter().map(|entry| &entry.target))
            .find(|id| self.exclusivity.is_renaming(id))
            .cloned()
    }

    fn push_links(
        &self,
        links: &[Link],
        cache: &mut BTreeMap<LinkKey, Link>,
        cache_deletions: &BTreeMap<LinkKey, Tombstone>,
        report: &mut SyncReport,
    ) -> Result<()> {
        for link in links {
            let key = link.key();
            if cache_deletions
                .get(&key)
                .is_some_and(|tomb| tomb.deleted_at >= link.created_at)
            {
                tracing::debug!(link = %key, "cache deleted this link, leaving it to pull");
                report.deferred += 1;
                continue;
            }

            let merged = match cache.get(&key) {
                Some(row) => Link::newer_of(row.clone(), link.clone()),
                None => link.clone(),
            };
            if cache.get(&key).is_some_and(|row| same_version(row, &merged)) {
                continue;
            }

            retry_with_backoff(&self.policy, "upsert_link", || self.cache.upsert_link(&merged))?;
            tracing::debug!(link = %key, "upserted cache row");
            report.cache_upserts += 1;
            cache.insert(key, merged);
        }
        Ok(())
    }

    /// Rewrites the `links` array of every note whose outgoing links change.
    /// Returns the keys owned by notes that failed to write.
    fn apply_to_notes(
        &self,
        snapshot: &LibrarySnapshot,
        plan: &PullPlan,
        report: &mut SyncReport,
    ) -> BTreeSet<LinkKey> {
        let mut failed_keys = BTreeSet::new();

        for loaded in &snapshot.notes {
            let Some(id) = &loaded.note.entry_id else {
                continue;
            };
            let Some(entries) = desired_entries(&loaded.note, id, plan) else {
                continue;
            };

            let written = loaded.parsed.render_with_links(&entries).and_then(|contents| {
                retry_with_backoff(&self.policy, "write_note", || {
                    self.notes.write_note(&loaded.note.location, &contents)
                })
            });
            match written {
                Ok(commit) => {
                    tracing::debug!(note = %loaded.note.location, %commit, "rewrote note links");
                    report.notes_written += 1;
                }
                Err(e) => {
                    tracing::warn!(note = %loaded.note.location, error = %e, "failed to write note");
                    report
                        .failures
                        .push(UnitFailure::new(loaded.note.location.as_str(), &e));
                    failed_keys.extend(
                        plan.resolved
                            .keys()
                            .chain(plan.deletions.keys())
                            .filter(|key| &key.source == id)
                            .cloned(),
                    );
                }
            }
        }
        failed_keys
    }

    fn apply_to_index(
        &self,
        snapshot: &LibrarySnapshot,
        plan: &PullPlan,
        failed_keys: &BTreeSet<LinkKey>,
        now: OffsetDateTime,
        report: &mut SyncReport,
    ) {
        let previous = snapshot.index.clone().unwrap_or_default();
        let previous_links = previous.links_by_key();
        let mut links: BTreeMap<LinkKey, Link> = BTreeMap::new();

        let keep_previous = plan
            .conflicts
            .iter()
            .map(|c| &c.key)
            .chain(failed_keys.iter());
        for key in keep_previous {
            if let Some(link) = previous_links.get(key) {
                links.insert(key.clone(), link.clone());
            }
        }
        for (key, link) in &plan.resolved {
            if !failed_keys.contains(key) {
                links.insert(key.clone(), link.clone());
            }
        }

        let mut deletions = previous.deletions_by_key();
        for (key, tomb) in &plan.deletions {
            if !failed_keys.contains(key) {
                deletions.insert(key.clone(), tomb.clone());
            }
        }
        deletions.retain(|key, _| !links.contains_key(key));

        self.write_index_if_changed(snapshot, links, deletions, now, report);
    }

    fn apply_to_cache(
        &self,
        cache: &BTreeMap<LinkKey, Link>,
        plan: &PullPlan,
        report: &mut SyncReport,
    ) {
        for (key, link) in &plan.resolved {
            if cache.get(key).is_some_and(|row| same_version(row, link)) {
                continue;
            }
            match retry_with_backoff(&self.policy, "upsert_link", || self.cache.upsert_link(link)) {
                Ok(()) => report.cache_upserts += 1,
                Err(e) => {
                    tracing::warn!(link = %key, error = %e, "failed to upsert cache row");
                    report.failures.push(UnitFailure::new(key.to_string(), &e));
                }
            }
        }

        for (key, tomb) in &plan.deletions {
            if !cache.contains_key(key) {
                continue;
            }
            match retry_with_backoff(&self.policy, "delete_link", || {
                self.cache.delete_link(key, tomb.deleted_at)
            }) {
                Ok(_) => report.cache_deletes += 1,
                Err(e) => {
                    tracing::warn!(link = %key, error = %e, "failed to delete cache row");
                    report.failures.push(UnitFailure::new(key.to_string(), &e));
                }
            }
        }
    }

    fn write_index_if_changed(
        &self,
        snapshot: &LibrarySnapshot,
        links: BTreeMap<LinkKey, Link>,
        deletions: BTreeMap<LinkKey, Tombstone>,
        now: OffsetDateTime,
        report: &mut SyncReport,
    ) {
        match write_index(
            self.index,
            &self.policy,
            snapshot,
            links.into_values().collect(),
            deletions.into_values().collect(),
            now,
        ) {
            Ok(commit) => report.index_commit = commit,
            Err(e) => {
                tracing::warn!(error = %e, "failed to write link index");
                report.failures.push(UnitFailure::new(INDEX_FILE, &e));
            }
        }
    }

    fn list_cache(&self) -> Result<Vec<Link>> {
        let rows = retry_with_backoff(&self.policy, "list_links", || {
            self.cache.list_links(&LinkFilter::default())
        })?;
        Ok(rows.into_iter().map(|row| row.link).collect())
    }

    fn cache_tombstones(&self) -> Result<BTreeMap<LinkKey, Tombstone>> {
        let tombs = retry_with_backoff(&self.policy, "tombstones", || self.cache.tombstones())?;
        let mut latest: BTreeMap<LinkKey, Tombstone> = BTreeMap::new();
        for tomb in tombs {
            if latest
                .get(&tomb.key)
                .is_none_or(|existing| tomb.deleted_at > existing.deleted_at)
            {
                latest.insert(tomb.key.clone(), tomb);
            }
        }
        Ok(latest)
    }
}

/// Writes a new index document when its links, deletions or derived stats
/// differ from the snapshot's. Returns the commit when something was written.
pub(crate) fn write_index(
    store: &dyn LinkIndexStore,
    policy: &RetryPolicy,
    snapshot: &LibrarySnapshot,
    links: Vec<Link>,
    deletions: Vec<Tombstone>,
    now: OffsetDateTime,
) -> Result<Option<CommitRef>> {
    let stats = compute_stats(&links, &snapshot.entry_ids(), MOST_LINKED_LIMIT);
    let mut next = LinkIndex {
        version: INDEX_VERSION,
        updated_at: now,
        links,
        stats,
        deletions,
    };

    let unchanged = match &snapshot.index {
        Some(previous) => previous.same_content(&next) && previous.stats == next.stats,
        None => next.links.is_empty() && next.deletions.is_empty(),
    };
    if unchanged {
        return Ok(None);
    }

    next.touch(now);
    let commit = retry_with_backoff(policy, "write_index", || store.write_index(&next))?;
    tracing::debug!(%commit, links = next.links.len(), "wrote link index");
    Ok(Some(commit))
}

/// The frontmatter `links` array a note should carry after the pull, or
/// `None` when it is already right.
///
/// Existing entries keep their position; new links are appended in key order.
fn desired_entries(note: &Note, id: &EntryId, plan: &PullPlan) -> Option<Vec<FrontmatterLink>> {
    let mut changed = false;
    let mut seen: BTreeSet<LinkKey> = BTreeSet::new();
    let mut entries = Vec::with_capacity(note.outgoing_links.len());

    for entry in &note.outgoing_links {
        if &entry.target == id {
            entries.push(entry.clone());
            continue;
        }
        let key = LinkKey::new(id.clone(), entry.target.clone(), entry.link_type);
        if plan.deletions.contains_key(&key) || !seen.insert(key.clone()) {
            changed = true;
            continue;
        }
        match plan.resolved.get(&key) {
            Some(link) if !same_version(&entry.to_link(id), link) => {
                entries.push(FrontmatterLink::from_link(link));
                changed = true;
            }
            _ => entries.push(entry.clone()),
        }
    }

    for (key, link) in &plan.resolved {
        if &key.source == id && !seen.contains(key) {
            entries.push(FrontmatterLink::from_link(link));
            changed = true;
        }
    }

    changed.then_some(entries)
}

fn scoped_note<'s>(snapshot: &'s LibrarySnapshot, location: &NoteLocation) -> Result<&'s LoadedNote> {
    if let Some(loaded) = snapshot.find_by_location(location) {
        return Ok(loaded);
    }
    if let Some(malformed) = snapshot.malformed.iter().find(|m| &m.location == location) {
        return Err(LinkError::structural(location.as_str(), malformed.detail.clone()));
    }
    Err(LinkError::NotFound(location.to_string()))
}

/// Picks the version both sides should carry, or `None` on a conflict.
fn resolve(a: &Link, b: &Link) -> Option<Link> {
    if a.created_at != b.created_at {
        let newer = if a.created_at > b.created_at { a } else { b };
        Some(newer.clone())
    } else if a.same_content(b) {
        Some(Link::newer_of(a.clone(), b.clone()))
    } else {
        None
    }
}

fn is_fresh(tomb: &Tombstone, now: OffsetDateTime, window: Duration) -> bool {
    now - tomb.deleted_at <= window
}

/// Same timestamp and payload. Provenance is ignored.
fn same_version(a: &Link, b: &Link) -> bool {
    a.created_at == b.created_at && a.same_content(b)
}

/// The cache rows with missing symmetric mirrors filled in, except where the
/// cache itself deleted the mirror after it was created.
fn mirrored_view(
    rows: &[Link],
    deletions: &BTreeMap<LinkKey, Tombstone>,
) -> BTreeMap<LinkKey, Link> {
    let stored: BTreeSet<LinkKey> = rows.iter().map(Link::key).collect();
    keyed(expand_symmetric(rows))
        .into_iter()
        .filter(|(key, link)| {
            stored.contains(key)
                || deletions
                    .get(key)
                    .is_none_or(|tomb| tomb.deleted_at < link.created_at)
        })
        .collect()
}

fn keyed<I>(links: I) -> BTreeMap<LinkKey, Link>
where
    I: IntoIterator<Item = Link>,
{
    let mut map = BTreeMap::new();
    for link in links {
        if !link.is_self_link() {
            merge_into(&mut map, link);
        }
    }
    map
}

fn merge_into(map: &mut BTreeMap<LinkKey, Link>, link: Link) {
    let key = link.key();
    let merged = match map.remove(&key) {
        Some(existing) => Link::newer_of(existing, link),
        None => link,
    };
    map.insert(key, merged);
}

/// Each link followed by its mirror when the type is symmetric.
fn with_mirrors<I>(links: I) -> Vec<Link>
where
    I: IntoIterator<Item = Link>,
{
    let mut out = Vec::new();
    for link in links {
        if link.link_type.is_symmetric() {
            out.push(link.mirrored());
        }
        out.push(link);
    }
    out
}

#[cfg(test)]
mod tests;
