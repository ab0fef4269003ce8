//! Read-only structural checks over a library snapshot and the cache rows.
//!
//! Nothing here reads note bodies beyond checking that one exists.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::graph::{LinkGraph, expand_symmetric};
use crate::library::LibrarySnapshot;
use crate::models::{EntryId, IdFormat, Link, LinkKey, NoteLocation, category_alias_of, normalize_category};
use crate::store::INDEX_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectCategory {
    DoubleFrontmatter,
    LegacyIdFormat,
    MissingContentHash,
    CategoryMismatch,
    CategoryTypo,
    OrphanedLink,
    AsymmetricLink,
    FrontmatterIndexMismatch,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 8] = [
        DefectCategory::DoubleFrontmatter,
        DefectCategory::LegacyIdFormat,
        DefectCategory::MissingContentHash,
        DefectCategory::CategoryMismatch,
        DefectCategory::CategoryTypo,
        DefectCategory::OrphanedLink,
        DefectCategory::AsymmetricLink,
        DefectCategory::FrontmatterIndexMismatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DoubleFrontmatter => "double_frontmatter",
            Self::LegacyIdFormat => "legacy_id_format",
            Self::MissingContentHash => "missing_content_hash",
            Self::CategoryMismatch => "category_mismatch",
            Self::CategoryTypo => "category_typo",
            Self::OrphanedLink => "orphaned_link",
            Self::AsymmetricLink => "asymmetric_link",
            Self::FrontmatterIndexMismatch => "frontmatter_index_mismatch",
        }
    }
}

/// One structural problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Defect {
    pub category: DefectCategory,
    pub entry_ids: Vec<EntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<NoteLocation>,
    pub detail: String,
}

/// Counts describing what was scanned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub notes_scanned: usize,
    pub malformed_notes: usize,
    pub unreadable_notes: usize,
    pub frontmatter_links: usize,
    pub index_links: usize,
    pub cache_links: usize,
    /// Notes per effective category.
    pub categories: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub stats: LibraryStats,
    pub counts: BTreeMap<DefectCategory, usize>,
    pub defects: Vec<Defect>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    pub fn count(&self, category: DefectCategory) -> usize {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn of(&self, category: DefectCategory) -> impl Iterator<Item = &Defect> {
        self.defects.iter().filter(move |d| d.category == category)
    }

    fn push(&mut self, defect: Defect) {
        *self.counts.entry(defect.category).or_insert(0) += 1;
        self.defects.push(defect);
    }
}

/// Scans the snapshot and the cache rows for every defect category.
pub fn validate(snapshot: &LibrarySnapshot, cache: &[Link]) -> ValidationReport {
    let frontmatter = snapshot.frontmatter_links();
    let mut report = ValidationReport {
        stats: collect_stats(snapshot, &frontmatter, cache),
        ..ValidationReport::default()
    };
    let known = snapshot.entry_ids();

    check_frontmatter_blocks(snapshot, &mut report);
    check_ids(snapshot, &mut report);
    check_content_hashes(snapshot, &mut report);
    check_categories(snapshot, &mut report);
    check_category_folders(snapshot, &mut report);
    check_orphans(&known, [frontmatter.as_slice(), snapshot.index_links(), cache], &mut report);
    check_symmetry("frontmatter", &frontmatter, Some(&known), &mut report);
    check_symmetry("index", snapshot.index_links(), None, &mut report);
    check_symmetry("cache", cache, None, &mut report);
    check_index(snapshot, &frontmatter, &mut report);

    tracing::info!(
        notes = report.stats.notes_scanned,
        defects = report.defects.len(),
        "validation complete"
    );
    report
}

fn collect_stats(snapshot: &LibrarySnapshot, frontmatter: &[Link], cache: &[Link]) -> LibraryStats {
    let mut categories = BTreeMap::new();
    for loaded in &snapshot.notes {
        *categories.entry(loaded.note.effective_category()).or_insert(0) += 1;
    }
    LibraryStats {
        notes_scanned: snapshot.note_count(),
        malformed_notes: snapshot.malformed.len(),
        unreadable_notes: snapshot.read_failures.len(),
        frontmatter_links: frontmatter.len(),
        index_links: snapshot.index_links().len(),
        cache_links: cache.len(),
        categories,
    }
}

fn check_frontmatter_blocks(snapshot: &LibrarySnapshot, report: &mut ValidationReport) {
    for malformed in &snapshot.malformed {
        report.push(Defect {
            category: DefectCategory::DoubleFrontmatter,
            entry_ids: Vec::new(),
            location: Some(malformed.location.clone()),
            detail: format!("frontmatter cannot be parsed: {}", malformed.detail),
        });
    }
    for loaded in snapshot.notes.iter().filter(|l| l.parsed.is_duplicated()) {
        report.push(Defect {
            category: DefectCategory::DoubleFrontmatter,
            entry_ids: loaded.note.entry_id.iter().cloned().collect(),
            location: Some(loaded.note.location.clone()),
            detail: format!("{} frontmatter blocks", loaded.parsed.block_count()),
        });
    }
}

fn check_ids(snapshot: &LibrarySnapshot, report: &mut ValidationReport) {
    for loaded in &snapshot.notes {
        let detail = match &loaded.note.entry_id {
            None => "note has no entry id".to_string(),
            Some(id) => match id.format() {
                IdFormat::Canonical => continue,
                IdFormat::Legacy => format!("legacy entry id {id}"),
                IdFormat::Malformed => format!("malformed entry id {id}"),
            },
        };
        report.push(Defect {
            category: DefectCategory::LegacyIdFormat,
            entry_ids: loaded.note.entry_id.iter().cloned().collect(),
            location: Some(loaded.note.location.clone()),
            detail,
        });
    }
}

fn check_content_hashes(snapshot: &LibrarySnapshot, report: &mut ValidationReport) {
    for loaded in &snapshot.notes {
        if loaded.parsed.has_body() && loaded.note.content_hash.is_none() {
            report.push(Defect {
                category: DefectCategory::MissingContentHash,
                entry_ids: loaded.note.entry_id.iter().cloned().collect(),
                location: Some(loaded.note.location.clone()),
                detail: "note has a body but no content_hash".to_string(),
            });
        }
    }
}

fn check_categories(snapshot: &LibrarySnapshot, report: &mut ValidationReport) {
    for loaded in &snapshot.notes {
        let (Some(declared), Some(folder)) = (&loaded.note.category, loaded.note.folder_category())
        else {
            continue;
        };
        let declared = normalize_category(declared);
        if declared != folder {
            report.push(Defect {
                category: DefectCategory::CategoryMismatch,
                entry_ids: loaded.note.entry_id.iter().cloned().collect(),
                location: Some(loaded.note.location.clone()),
                detail: format!("declared category '{declared}' but stored under '{folder}'"),
            });
        }
    }
}

/// One defect per storage grouping whose name is a known variant spelling.
fn check_category_folders(snapshot: &LibrarySnapshot, report: &mut ValidationReport) {
    let mut folders: BTreeMap<&str, Vec<EntryId>> = BTreeMap::new();
    let locations = snapshot
        .notes
        .iter()
        .map(|l| (&l.note.location, l.note.entry_id.as_ref()))
        .chain(snapshot.malformed.iter().map(|m| (&m.location, None)))
        .chain(snapshot.read_failures.iter().map(|f| (&f.location, None)));
    for (location, id) in locations {
        if let Some(folder) = location.folder() {
            let ids = folders.entry(folder).or_default();
            ids.extend(id.cloned());
        }
    }

    for (folder, ids) in folders {
        if let Some(canonical) = category_alias_of(folder) {
            report.push(Defect {
                category: DefectCategory::CategoryTypo,
                entry_ids: ids,
                location: None,
                detail: format!("folder '{folder}' is a variant of category '{canonical}'"),
            });
        }
    }
}

/// One defect per link key whose target has no note, across every store.
fn check_orphans(
    known: &BTreeSet<EntryId>,
    stores: [&[Link]; 3],
    report: &mut ValidationReport,
) {
    let mut seen: BTreeSet<LinkKey> = BTreeSet::new();
    for link in stores.into_iter().flatten() {
        if link.is_self_link() || known.contains(&link.target_entry_id) {
            continue;
        }
        let key = link.key();
        if seen.insert(key.clone()) {
            report.push(Defect {
                category: DefectCategory::OrphanedLink,
                entry_ids: vec![key.source.clone(), key.target.clone()],
                location: None,
                detail: format!("{key}: target note does not exist"),
            });
        }
    }
}

/// Symmetric links missing their mirror within one store.
///
/// For frontmatter, a mirror is only expected when its source note exists.
fn check_symmetry(
    store: &str,
    links: &[Link],
    existing_notes: Option<&BTreeSet<EntryId>>,
    report: &mut ValidationReport,
) {
    let graph = LinkGraph::from_links(links.iter().cloned());
    for link in graph.missing_mirrors() {
        if existing_notes.is_some_and(|notes| !notes.contains(&link.target_entry_id)) {
            continue;
        }
        report.push(Defect {
            category: DefectCategory::AsymmetricLink,
            entry_ids: vec![link.source_entry_id.clone(), link.target_entry_id.clone()],
            location: None,
            detail: format!("{store}: {} has no mirror", link.key()),
        });
    }
}

fn check_index(snapshot: &LibrarySnapshot, frontmatter: &[Link], report: &mut ValidationReport) {
    if let Some(error) = &snapshot.index_error {
        report.push(Defect {
            category: DefectCategory::FrontmatterIndexMismatch,
            entry_ids: Vec::new(),
            location: Some(NoteLocation::new(INDEX_FILE)),
            detail: format!("link index is malformed: {error}"),
        });
        return;
    }

    let declared: BTreeSet<LinkKey> = expand_symmetric(frontmatter).iter().map(Link::key).collect();
    let indexed: BTreeSet<LinkKey> = snapshot
        .index_links()
        .iter()
        .filter(|link| !link.is_self_link())
        .map(Link::key)
        .collect();

    for key in declared.difference(&indexed) {
        report.push(Defect {
            category: DefectCategory::FrontmatterIndexMismatch,
            entry_ids: vec![key.source.clone(), key.target.clone()],
            location: None,
            detail: format!("{key} is in frontmatter but not in the index"),
        });
    }
    for key in indexed.difference(&declared) {
        report.push(Defect {
            category: DefectCategory::FrontmatterIndexMismatch,
            entry_ids: vec![key.source.clone(), key.target.clone()],
            location: None,
            detail: format!("{key} is in the index but not in frontmatter"),
        });
    }
}
