//! Blind structural repair of the library.
//!
//! Each step works from frontmatter, the index and the cache only. Steps run
//! alone or as the fixed pipeline of [`RecoveryStep::PIPELINE`]; with
//! `dry_run` every step reports what it would change and writes nothing.

mod rename;

pub use rename::{RenamePlan, RenameState, RenameTransaction};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{LinkError, Result, UnitFailure};
use crate::frontmatter::{render, render_blocks, set_content_hash};
use crate::graph::expand_symmetric;
use crate::library::{LibrarySnapshot, LoadedNote};
use crate::models::{EntryId, LinkIndex, NoteLocation};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommitRef, INDEX_FILE, LinkCache, LinkFilter, LinkIndexStore, NoteStore};
use crate::validator::{ValidationReport, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Validate,
    FixFrontmatter,
    NormalizeIds,
    RebuildHashes,
    RebuildCache,
}

impl RecoveryStep {
    /// Order in which `full_recovery` runs the steps.
    pub const PIPELINE: [RecoveryStep; 5] = [
        RecoveryStep::Validate,
        RecoveryStep::FixFrontmatter,
        RecoveryStep::NormalizeIds,
        RecoveryStep::RebuildHashes,
        RecoveryStep::RebuildCache,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStep::Validate => "validate",
            RecoveryStep::FixFrontmatter => "fix_frontmatter",
            RecoveryStep::NormalizeIds => "normalize_ids",
            RecoveryStep::RebuildHashes => "rebuild_hashes",
            RecoveryStep::RebuildCache => "rebuild_cache",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Report intended changes without writing anything.
    pub dry_run: bool,
    /// Tenant prefix for canonical ids.
    pub tenant: Option<String>,
}

impl RecoveryOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// One change made, or intended in a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub location: NoteLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<EntryId>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: RecoveryStep,
    pub dry_run: bool,
    /// The step did not run at all.
    pub skipped: bool,
    pub processed: usize,
    /// Units actually written.
    pub modified: usize,
    pub changes: Vec<Change>,
    /// Notes left for an earlier step to repair first.
    pub deferred: Vec<NoteLocation>,
    /// Defects that cannot be repaired automatically.
    pub unresolved: Vec<UnitFailure>,
    pub failures: Vec<UnitFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl StepReport {
    fn new(step: RecoveryStep, dry_run: bool) -> Self {
        Self {
            step,
            dry_run,
            skipped: false,
            processed: 0,
            modified: 0,
            changes: Vec::new(),
            deferred: Vec::new(),
            unresolved: Vec::new(),
            failures: Vec::new(),
            validation: None,
        }
    }

    /// Some unit failed or was left unresolved.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || !self.unresolved.is_empty()
    }

    fn record_read_failures(&mut self, snapshot: &LibrarySnapshot) {
        for failure in &snapshot.read_failures {
            self.failures.push(UnitFailure {
                unit: failure.location.to_string(),
                error: failure.error.clone(),
                transient: false,
            });
        }
    }

    fn log(&self) {
        tracing::info!(
            step = %self.step,
            dry_run = self.dry_run,
            skipped = self.skipped,
            processed = self.processed,
            modified = self.modified,
            changes = self.changes.len(),
            unresolved = self.unresolved.len(),
            failures = self.failures.len(),
            "recovery step complete"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub steps: Vec<StepReport>,
}

impl RecoveryReport {
    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(StepReport::has_failures)
    }
}

/// Locks shared by every engine working on the same library.
///
/// A rename claims the ids it touches; the cache rebuild holds the cache
/// exclusively while renames hold it shared.
#[derive(Debug, Default)]
pub struct Exclusivity {
    renames: Mutex<HashSet<EntryId>>,
    cache: RwLock<()>,
}

impl Exclusivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims `ids` for one rename. Fails if any of them is already claimed.
    pub fn claim_rename(self: &Arc<Self>, ids: &[&EntryId]) -> Result<RenameGuard> {
        let mut in_flight = self.renames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = ids.iter().find(|id| in_flight.contains(**id)) {
            return Err(LinkError::RenameInFlight((*busy).clone()));
        }
        let ids: Vec<EntryId> = ids.iter().map(|id| (*id).clone()).collect();
        in_flight.extend(ids.iter().cloned());
        Ok(RenameGuard {
            exclusivity: Arc::clone(self),
            ids,
        })
    }

    pub fn is_renaming(&self, id: &EntryId) -> bool {
        self.renames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn cache_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its ids when dropped.
#[derive(Debug)]
pub struct RenameGuard {
    exclusivity: Arc<Exclusivity>,
    ids: Vec<EntryId>,
}

impl Drop for RenameGuard {
    fn drop(&mut self) {
        let mut in_flight = self
            .exclusivity
            .renames
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            in_flight.remove(id);
        }
    }
}

pub struct RecoveryEngine<'a> {
    notes: &'a dyn NoteStore,
    index: &'a dyn LinkIndexStore,
    cache: &'a dyn LinkCache,
    policy: RetryPolicy,
    exclusivity: Arc<Exclusivity>,
}

impl<'a> RecoveryEngine<'a> {
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

    /// Shares locks with other engines on the same library.
    pub fn with_exclusivity(mut self, exclusivity: Arc<Exclusivity>) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    pub fn exclusivity(&self) -> &Arc<Exclusivity> {
        &self.exclusivity
    }

    /// Runs every step in pipeline order, reloading the library between
    /// steps. A fatal error aborts the run.
    pub fn full_recovery(&self, options: &RecoveryOptions, now: OffsetDateTime) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            dry_run: options.dry_run,
            tenant: options.tenant.clone(),
            steps: Vec::with_capacity(RecoveryStep::PIPELINE.len()),
        };
        for step in RecoveryStep::PIPELINE {
            match self.run_step(step, options, now) {
                Ok(step_report) => report.steps.push(step_report),
                Err(e) => {
                    tracing::error!(%step, error = %e, "recovery aborted");
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    pub fn run_step(
        &self,
        step: RecoveryStep,
        options: &RecoveryOptions,
        now: OffsetDateTime,
    ) -> Result<StepReport> {
        let report = match step {
            RecoveryStep::Validate => self.validate(options),
            RecoveryStep::FixFrontmatter => self.fix_frontmatter(options),
            RecoveryStep::NormalizeIds => self.normalize_ids(options, now),
            RecoveryStep::RebuildHashes => self.rebuild_hashes(options),
            RecoveryStep::RebuildCache => self.rebuild_cache(options),
        }?;
        report.log();
        Ok(report)
    }

    pub fn validate(&self, options: &RecoveryOptions) -> Result<StepReport> {
        let snapshot = self.load()?;
        let rows = retry_with_backoff(&self.policy, "list_links", || {
            self.cache.list_links(&LinkFilter::default())
        })?;
        let rows: Vec<_> = rows.into_iter().map(|row| row.link).collect();

        let mut validation = validate(&snapshot, &rows);
        validation.tenant = options.tenant.clone();

        let mut report = StepReport::new(RecoveryStep::Validate, options.dry_run);
        report.processed = snapshot.note_count();
        report.record_read_failures(&snapshot);
        report.validation = Some(validation);
        Ok(report)
    }

    /// Merges duplicated frontmatter blocks into one.
    pub fn fix_frontmatter(&self, options: &RecoveryOptions) -> Result<StepReport> {
        let snapshot = self.load()?;
        let mut report = StepReport::new(RecoveryStep::FixFrontmatter, options.dry_run);
        report.processed = snapshot.note_count();
        report.record_read_failures(&snapshot);

        for malformed in &snapshot.malformed {
            report.unresolved.push(UnitFailure::new(
                malformed.location.as_str(),
                &LinkError::structural(malformed.location.as_str(), malformed.detail.clone()),
            ));
        }

        for loaded in snapshot.notes.iter().filter(|l| l.parsed.is_duplicated()) {
            let detail = format!(
                "merge {} frontmatter blocks into one",
                loaded.parsed.block_count()
            );
            let contents = render(&loaded.parsed.merged(), &loaded.parsed.body);
            self.apply_note_change(options, &mut report, loaded, contents, detail);
        }
        Ok(report)
    }

    /// Rewrites legacy, malformed and missing entry ids to their canonical
    /// form, together with every link referencing them.
    pub fn normalize_ids(&self, options: &RecoveryOptions, now: OffsetDateTime) -> Result<StepReport> {
        let snapshot = self.load()?;
        let mut report = StepReport::new(RecoveryStep::NormalizeIds, options.dry_run);
        report.processed = snapshot.note_count();
        report.record_read_failures(&snapshot);

        let plans = self.plan_renames(&snapshot, options.tenant.as_deref(), &mut report);
        let mut index = snapshot.index.clone();
        let mut known_ids = snapshot.entry_ids();

        for plan in plans {
            let mut change = Change {
                location: plan.location.clone(),
                entry_id: plan.old.clone(),
                renamed_to: Some(plan.new.clone()),
                detail: format!(
                    "rename {} to {}, {} referring notes",
                    plan.old.as_ref().map_or("(no id)", EntryId::as_str),
                    plan.new,
                    plan.referrers.len()
                ),
                commit: None,
            };
            if options.dry_run {
                report.changes.push(change);
                continue;
            }

            let location = plan.location.clone();
            match self.rename(plan, index.as_ref(), &known_ids, now)? {
                Ok((transaction, commits)) => {
                    let plan = transaction.plan();
                    tracing::info!(
                        note = %plan.location,
                        new_id = %plan.new,
                        referrers = transaction.referrer_count(),
                        "renamed entry"
                    );
                    if let Some(old) = &plan.old {
                        known_ids.remove(old);
                    }
                    known_ids.insert(plan.new.clone());
                    if let Some(next) = transaction.staged_index() {
                        index = Some(next.clone());
                    }
                    report.modified += commits.len();
                    change.commit = commits.into_iter().next();
                    report.changes.push(change);
                }
                Err(e) => {
                    tracing::warn!(note = %location, error = %e, "rename failed");
                    report.failures.push(UnitFailure::new(location.as_str(), &e));
                }
            }
        }
        Ok(report)
    }

    /// Writes `content_hash` where it is missing or does not match the body.
    pub fn rebuild_hashes(&self, options: &RecoveryOptions) -> Result<StepReport> {
        let snapshot = self.load()?;
        let mut report = StepReport::new(RecoveryStep::RebuildHashes, options.dry_run);
        report.processed = snapshot.note_count();
        report.record_read_failures(&snapshot);

        for loaded in &snapshot.notes {
            if !loaded.parsed.has_body() {
                continue;
            }
            let expected = loaded.parsed.content_hash();
            if loaded.note.content_hash.as_deref() == Some(expected.as_str()) {
                continue;
            }
            if loaded.parsed.is_duplicated() {
                report.deferred.push(loaded.note.location.clone());
                continue;
            }

            let detail = match &loaded.note.content_hash {
                Some(stale) => format!("replace content_hash {stale} with {expected}"),
                None => format!("add content_hash {expected}"),
            };
            let mut blocks = loaded.parsed.blocks.clone();
            if blocks.is_empty() {
                blocks.push(Default::default());
            }
            if let Some(first) = blocks.first_mut() {
                set_content_hash(first, &expected);
            }
            let contents = render_blocks(&blocks, &loaded.parsed.body);
            self.apply_note_change(options, &mut report, loaded, contents, detail);
        }
        Ok(report)
    }

    /// Clears the cache and repopulates it from frontmatter and the index.
    ///
    /// Never previewed: a dry run skips the step. Any failure is fatal and
    /// leaves the previous cache content in place.
    pub fn rebuild_cache(&self, options: &RecoveryOptions) -> Result<StepReport> {
        let mut report = StepReport::new(RecoveryStep::RebuildCache, options.dry_run);
        if options.dry_run {
            report.skipped = true;
            return Ok(report);
        }

        let snapshot = self.load()?;
        report.record_read_failures(&snapshot);
        if let Some(detail) = &snapshot.index_error {
            report.unresolved.push(UnitFailure::new(
                INDEX_FILE,
                &LinkError::structural(INDEX_FILE, detail.clone()),
            ));
        }

        let mut declared = snapshot.frontmatter_links();
        declared.extend(snapshot.index_links().iter().cloned());
        let links = expand_symmetric(&declared);
        report.processed = links.len();

        let _exclusive = self.exclusivity.cache_exclusive();
        let written = retry_with_backoff(&self.policy, "replace_all", || self.cache.replace_all(&links))
            .map_err(|e| LinkError::CacheRebuildFailure(e.to_string()))?;
        report.modified = written;
        Ok(report)
    }

    fn load(&self) -> Result<LibrarySnapshot> {
        LibrarySnapshot::load(self.notes, self.index, &self.policy)
    }

    /// Records the change and, outside a dry run, writes it.
    fn apply_note_change(
        &self,
        options: &RecoveryOptions,
        report: &mut StepReport,
        loaded: &LoadedNote,
        contents: Result<String>,
        detail: String,
    ) {
        let location = &loaded.note.location;
        let mut change = Change {
            location: location.clone(),
            entry_id: loaded.note.entry_id.clone(),
            renamed_to: None,
            detail,
            commit: None,
        };
        if options.dry_run {
            report.changes.push(change);
            return;
        }

        let written = contents.and_then(|contents| {
            retry_with_backoff(&self.policy, "write_note", || {
                self.notes.write_note(location, &contents)
            })
        });
        match written {
            Ok(commit) => {
                tracing::debug!(note = %location, %commit, step = %report.step, "rewrote note");
                change.commit = Some(commit);
                report.modified += 1;
                report.changes.push(change);
            }
            Err(e) => {
                tracing::warn!(note = %location, error = %e, step = %report.step, "failed to rewrite note");
                report.failures.push(UnitFailure::new(location.as_str(), &e));
            }
        }
    }

    /// Decides every rename, leaving conflicting claimants unresolved.
    fn plan_renames(
        &self,
        snapshot: &LibrarySnapshot,
        tenant: Option<&str>,
        report: &mut StepReport,
    ) -> Vec<RenamePlan> {
        let mut owners: BTreeMap<&EntryId, usize> = BTreeMap::new();
        for id in snapshot.notes.iter().filter_map(|l| l.note.entry_id.as_ref()) {
            *owners.entry(id).or_insert(0) += 1;
        }

        let mut claims: BTreeMap<EntryId, Vec<&LoadedNote>> = BTreeMap::new();
        for loaded in &snapshot.notes {
            if loaded.note.entry_id.as_ref().is_some_and(EntryId::is_canonical) {
                continue;
            }
            if loaded.parsed.is_duplicated() {
                report.deferred.push(loaded.note.location.clone());
                continue;
            }
            let target = EntryId::canonical(
                tenant,
                &loaded.note.effective_category(),
                &loaded.note.display_title(),
            );
            claims.entry(target).or_default().push(loaded);
        }

        let mut plans = Vec::new();
        for (new, claimants) in claims {
            let shared_old_id = claimants.iter().any(|l| {
                l.note
                    .entry_id
                    .as_ref()
                    .is_some_and(|id| owners.get(id).copied().unwrap_or(0) > 1)
            });
            let mut holders: Vec<String> = claimants
                .iter()
                .map(|l| l.note.location.to_string())
                .collect();
            if let Some(owner) = snapshot.find_by_id(&new) {
                holders.push(owner.note.location.to_string());
            }

            if holders.len() > 1 || shared_old_id {
                let conflict = LinkError::RenameConflict {
                    new_id: new.clone(),
                    claimants: holders,
                };
                tracing::warn!(error = %conflict, "leaving conflicting renames unresolved");
                for loaded in claimants {
                    report
                        .unresolved
                        .push(UnitFailure::new(loaded.note.location.as_str(), &conflict));
                }
                continue;
            }

            let Some(loaded) = claimants.into_iter().next() else {
                continue;
            };
            let old = loaded.note.entry_id.clone();
            if let Some(old) = &old
                && let Some(blocked) = unreadable_referrers(snapshot, old)
            {
                tracing::warn!(note = %loaded.note.location, error = %blocked, "rename would leave references behind");
                report
                    .unresolved
                    .push(UnitFailure::new(loaded.note.location.as_str(), &blocked));
                continue;
            }
            let referrers = match &old {
                Some(old) => referrers_of(snapshot, old, &loaded.note.location),
                None => Vec::new(),
            };
            plans.push(RenamePlan {
                location: loaded.note.location.clone(),
                old,
                new,
                referrers,
            });
        }
        plans
    }

    /// Stages and commits one rename under its exclusivity claim.
    ///
    /// The outer error is an exclusivity violation and aborts the run; the
    /// inner one is a failure of this rename only.
    fn rename(
        &self,
        plan: RenamePlan,
        index: Option<&LinkIndex>,
        known_ids: &BTreeSet<EntryId>,
        now: OffsetDateTime,
    ) -> Result<Result<(RenameTransaction, Vec<CommitRef>)>> {
        let mut claimed: Vec<&EntryId> = vec![&plan.new];
        claimed.extend(plan.old.as_ref());
        let _claim = self.exclusivity.claim_rename(&claimed)?;
        let _cache = self.exclusivity.cache_shared();

        let outcome = RenameTransaction::stage(plan, self.notes, &self.policy, index, known_ids, now)
            .and_then(|mut transaction| {
                let commits = transaction.commit(self.notes, self.index, self.cache, &self.policy)?;
                Ok((transaction, commits))
            });
        Ok(outcome)
    }
}

/// Notes other than `except` whose frontmatter links target `id`.
fn referrers_of(snapshot: &LibrarySnapshot, id: &EntryId, except: &NoteLocation) -> Vec<NoteLocation> {
    snapshot
        .notes
        .iter()
        .filter(|l| &l.note.location != except)
        .filter(|l| l.note.outgoing_links.iter().any(|entry| &entry.target == id))
        .map(|l| l.note.location.clone())
        .collect()
}

/// Notes that may refer to `id` but cannot be rewritten: malformed notes
/// mentioning it, or any note that could not be read at all.
fn unreadable_referrers(snapshot: &LibrarySnapshot, id: &EntryId) -> Option<LinkError> {
    let mut blocking: Vec<&str> = snapshot
        .malformed
        .iter()
        .filter(|m| m.raw.contains(id.as_str()))
        .map(|m| m.location.as_str())
        .collect();
    blocking.extend(snapshot.read_failures.iter().map(|f| f.location.as_str()));
    if blocking.is_empty() {
        return None;
    }
    Some(LinkError::structural(
        blocking[0],
        format!(
            "cannot rewrite references to {id} in {}; repair these notes first",
            blocking.join(", ")
        ),
    ))
}
