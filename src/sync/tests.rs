use super::*;
use crate::db::Database;
use crate::frontmatter::ParsedNote;
use crate::store::FsLibrary;
use std::cell::Cell;
use std::fs;
use std::io;
use std::path::Path;
use tempfile::{TempDir, tempdir};
use time::macros::datetime;

const NOW: OffsetDateTime = datetime!(2024-06-01 0:00 UTC);

struct Fixture {
    dir: TempDir,
    library: FsLibrary,
    db: Database,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let library = FsLibrary::new(dir.path());
        let db = Database::in_memory().expect("in-memory cache");
        Self { dir, library, db }
    }

    fn note(&self, relative: &str, id: &str, links_yaml: &str) {
        let contents = if links_yaml.is_empty() {
            format!("---\nid: {id}\n---\n\nbody of {id}\n")
        } else {
            format!("---\nid: {id}\nlinks:\n{links_yaml}---\n\nbody of {id}\n")
        };
        write(self.dir.path(), relative, &contents);
    }

    fn engine(&self) -> SyncEngine<'_> {
        SyncEngine::new(&self.library, &self.library, &self.db).with_policy(RetryPolicy::none())
    }

    fn rows(&self) -> Vec<Link> {
        self.db
            .list_links(&LinkFilter::default())
            .expect("list rows")
            .into_iter()
            .map(|row| row.link)
            .collect()
    }

    fn note_links(&self, relative: &str) -> Vec<FrontmatterLink> {
        let raw = fs::read_to_string(self.dir.path().join(relative)).expect("read note");
        let parsed = ParsedNote::parse(relative, &raw).expect("parse note");
        Note::from_frontmatter(NoteLocation::new(relative), &parsed.merged())
            .expect("structural view")
            .outgoing_links
    }

    fn index(&self) -> Option<LinkIndex> {
        self.library.read_index().expect("read index")
    }
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn link(source: &str, target: &str, link_type: LinkType, at: OffsetDateTime) -> Link {
    Link::builder(source, target, link_type).created_at(at).build()
}

fn key(source: &str, target: &str, link_type: LinkType) -> LinkKey {
    LinkKey::new(source.into(), target.into(), link_type)
}

// --- push ---

#[test]
fn push_symmetric_link_creates_both_rows() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: related\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.note("concept/b.md", "kb-b", "");

    let report = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(report.cache_upserts, 2);
    assert!(!report.has_failures());

    let keys: Vec<LinkKey> = fx.rows().iter().map(Link::key).collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&key("kb-a", "kb-b", LinkType::Related)));
    assert!(keys.contains(&key("kb-b", "kb-a", LinkType::Related)));
}

#[test]
fn push_merges_into_index_with_stats() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: blocks\n  - target: kb-gone\n    type: references\n",
    );
    fx.note("concept/b.md", "kb-b", "");

    let report = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert!(report.index_commit.is_some());

    let index = fx.index().expect("index written");
    assert_eq!(index.links.len(), 2);
    assert_eq!(index.stats.total_links, 2);
    assert_eq!(index.stats.orphaned_targets, vec![EntryId::new("kb-gone")]);
    assert_eq!(index.updated_at, NOW);
}

#[test]
fn push_twice_is_a_noop() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: related\n  - target: kb-b\n    type: implements\n",
    );
    fx.note("concept/b.md", "kb-b", "");

    fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    let rows = fx.rows();
    let index = fx.index();

    let again = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(again.cache_upserts, 0);
    assert_eq!(again.index_commit, None);
    assert_eq!(fx.rows(), rows);
    assert_eq!(fx.index(), index);
}

#[test]
fn push_never_replaces_a_newer_cache_row() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: supports\n    description: old\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    let newer = Link::builder("kb-a", "kb-b", LinkType::Supports)
        .description("new")
        .created_at(datetime!(2024-03-01 0:00 UTC))
        .build();
    fx.db.upsert_link(&newer).unwrap();

    let report = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(report.cache_upserts, 0);
    assert_eq!(fx.rows()[0].description.as_deref(), Some("new"));
}

#[test]
fn push_critical_types_only() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: blocks\n  - target: kb-b\n    type: supports\n  - target: kb-c\n    type: implements\n",
    );

    let request = PushRequest::full_scan().types(TypeSelection::Critical);
    fx.engine().push_to_cache(&request, NOW).unwrap();
    let types: BTreeSet<LinkType> = fx.rows().iter().map(|l| l.link_type).collect();
    assert_eq!(
        types,
        BTreeSet::from([LinkType::Blocks, LinkType::Implements])
    );

    let request = PushRequest::full_scan().types(TypeSelection::Routine);
    fx.engine().push_to_cache(&request, NOW).unwrap();
    assert_eq!(fx.rows().len(), 3);
}

#[test]
fn push_single_note_scope() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: blocks\n");
    fx.note("concept/b.md", "kb-b", "  - target: kb-c\n    type: blocks\n");

    let report = fx
        .engine()
        .push_to_cache(&PushRequest::note(NoteLocation::new("concept/b.md")), NOW)
        .unwrap();
    assert_eq!(report.notes_scanned, 1);
    let rows = fx.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_entry_id.as_str(), "kb-b");
    assert_eq!(
        fx.db.last_synced(&EntryId::new("kb-b")).unwrap(),
        Some(NOW)
    );
    assert_eq!(fx.db.last_synced(&EntryId::new("kb-a")).unwrap(), None);
}

#[test]
fn push_unknown_note_is_not_found() {
    let fx = Fixture::new();
    let err = fx
        .engine()
        .push_to_cache(&PushRequest::note(NoteLocation::new("concept/none.md")), NOW)
        .unwrap_err();
    assert!(matches!(err, LinkError::NotFound(_)));
}

#[test]
fn batching_does_not_change_the_result() {
    let links_a = "  - target: kb-b\n    type: related\n    description: from a\n    created_at: 2024-01-01T00:00:00Z\n";
    let links_b = "  - target: kb-a\n    type: related\n    description: from b\n    created_at: 2024-02-01T00:00:00Z\n  - target: kb-c\n    type: blocks\n";

    let full = Fixture::new();
    full.note("concept/a.md", "kb-a", links_a);
    full.note("concept/b.md", "kb-b", links_b);
    full.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();

    let batched = Fixture::new();
    batched.note("concept/a.md", "kb-a", links_a);
    batched.note("concept/b.md", "kb-b", links_b);
    for location in ["concept/b.md", "concept/a.md"] {
        let critical = PushRequest::note(NoteLocation::new(location)).types(TypeSelection::Critical);
        batched.engine().push_to_cache(&critical, NOW).unwrap();
    }
    batched
        .engine()
        .push_to_cache(&PushRequest::full_scan().types(TypeSelection::Routine), NOW)
        .unwrap();

    assert_eq!(full.rows(), batched.rows());
    assert_eq!(
        full.index().map(|i| i.links),
        batched.index().map(|i| i.links)
    );
    assert!(
        full.rows()
            .iter()
            .filter(|l| l.link_type == LinkType::Related)
            .all(|l| l.description.as_deref() == Some("from b"))
    );
}

#[test]
fn push_defers_links_the_cache_deleted() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: blocks\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.db
        .delete_link(&key("kb-a", "kb-b", LinkType::Blocks), datetime!(2024-05-31 0:00 UTC))
        .unwrap();

    let report = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(report.deferred, 1);
    assert!(fx.rows().is_empty());
}

#[test]
fn push_defers_notes_touching_an_id_under_rename() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: implements\n");
    fx.note("concept/c.md", "kb-c", "  - target: kb-d\n    type: blocks\n");
    let exclusivity = Exclusivity::new();
    let claim = exclusivity.claim_rename(&[&EntryId::new("kb-a")]).unwrap();

    let report = fx
        .engine()
        .with_exclusivity(Arc::clone(&exclusivity))
        .push_to_cache(&PushRequest::full_scan(), NOW)
        .unwrap();

    assert_eq!(report.deferred_notes, vec![NoteLocation::new("concept/a.md")]);
    assert!(!report.has_failures());
    let keys: Vec<LinkKey> = fx.rows().iter().map(Link::key).collect();
    assert_eq!(keys, vec![key("kb-c", "kb-d", LinkType::Blocks)]);
    let index = fx.index().expect("index written");
    assert!(index.links.iter().all(|l| !l.key().touches(&EntryId::new("kb-a"))));

    drop(claim);
    let later = fx
        .engine()
        .with_exclusivity(exclusivity)
        .push_to_cache(&PushRequest::full_scan(), NOW)
        .unwrap();
    assert!(later.deferred_notes.is_empty());
    assert_eq!(fx.rows().len(), 2);
}

#[test]
fn push_defers_a_referrer_of_an_id_under_rename() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: references\n");
    let exclusivity = Exclusivity::new();
    let _claim = exclusivity.claim_rename(&[&EntryId::new("kb-b")]).unwrap();

    let report = fx
        .engine()
        .with_exclusivity(exclusivity)
        .push_to_cache(&PushRequest::full_scan(), NOW)
        .unwrap();

    assert_eq!(report.deferred_notes.len(), 1);
    assert!(fx.rows().is_empty());
}

#[test]
fn pull_refuses_to_run_during_a_rename() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "");
    fx.db
        .upsert_link(&link("kb-a", "kb-b", LinkType::Supports, NOW))
        .unwrap();
    let before = fs::read_to_string(fx.dir.path().join("concept/a.md")).unwrap();
    let exclusivity = Exclusivity::new();
    let _claim = exclusivity.claim_rename(&[&EntryId::new("kb-a")]).unwrap();

    let err = fx
        .engine()
        .with_exclusivity(exclusivity)
        .pull_from_cache(NOW)
        .unwrap_err();

    assert!(matches!(err, LinkError::RenameInFlight(id) if id == EntryId::new("kb-a")));
    assert_eq!(fs::read_to_string(fx.dir.path().join("concept/a.md")).unwrap(), before);
    assert!(fx.index().is_none());
}

// --- pull ---

#[test]
fn pull_takes_newer_description_from_cache() {
    let fx = Fixture::new();
    fx.note(
        "concept/x.md",
        "kb-x",
        "  - target: kb-y\n    type: supports\n    description: old\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.note("concept/y.md", "kb-y", "");
    fx.db
        .upsert_link(
            &Link::builder("kb-x", "kb-y", LinkType::Supports)
                .description("new")
                .created_at(datetime!(2024-02-01 0:00 UTC))
                .build(),
        )
        .unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.notes_written, 1);
    assert!(report.conflicts.is_empty());

    let links = fx.note_links("concept/x.md");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].description.as_deref(), Some("new"));
    assert_eq!(links[0].created_at, Some(datetime!(2024-02-01 0:00 UTC)));

    let index = fx.index().expect("index written");
    assert_eq!(index.links[0].description.as_deref(), Some("new"));
}

#[test]
fn pull_keeps_body_and_other_keys() {
    let fx = Fixture::new();
    write(
        fx.dir.path(),
        "concept/x.md",
        "---\nid: kb-x\ntitle: Kept Title\ntags:\n- a\n---\n\n# Heading\n\nBody text.\n",
    );
    fx.db
        .upsert_link(&link("kb-x", "kb-y", LinkType::Blocks, datetime!(2024-02-01 0:00 UTC)))
        .unwrap();

    fx.engine().pull_from_cache(NOW).unwrap();
    let raw = fs::read_to_string(fx.dir.path().join("concept/x.md")).unwrap();
    let parsed = ParsedNote::parse("concept/x.md", &raw).unwrap();
    assert_eq!(parsed.body, "# Heading\n\nBody text.\n");
    assert_eq!(
        parsed.merged().get("title").and_then(serde_yaml::Value::as_str),
        Some("Kept Title")
    );
    assert_eq!(fx.note_links("concept/x.md").len(), 1);
}

#[test]
fn pull_creates_cache_only_symmetric_link_on_both_notes() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "");
    fx.note("concept/b.md", "kb-b", "");
    fx.db
        .upsert_link(&link("kb-a", "kb-b", LinkType::Related, datetime!(2024-02-01 0:00 UTC)))
        .unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.notes_written, 2);
    assert_eq!(report.cache_upserts, 1);
    assert_eq!(fx.note_links("concept/a.md")[0].target.as_str(), "kb-b");
    assert_eq!(fx.note_links("concept/b.md")[0].target.as_str(), "kb-a");
    assert_eq!(fx.rows().len(), 2);
}

#[test]
fn pull_pushes_authoritative_only_link_to_cache() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: depends_on\n");

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.cache_upserts, 1);
    assert_eq!(report.notes_written, 0);
    assert_eq!(fx.rows().len(), 1);
}

#[test]
fn pull_equal_timestamps_is_a_conflict_and_writes_nothing() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: supports\n    description: mine\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    let before = fs::read_to_string(fx.dir.path().join("concept/a.md")).unwrap();
    fx.db
        .upsert_link(
            &Link::builder("kb-a", "kb-b", LinkType::Supports)
                .description("theirs")
                .created_at(datetime!(2024-01-01 0:00 UTC))
                .build(),
        )
        .unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::EqualTimestamps);
    assert_eq!(report.conflicts[0].detected_at, NOW);
    assert_eq!(report.notes_written, 0);
    assert_eq!(report.cache_upserts, 0);

    let after = fs::read_to_string(fx.dir.path().join("concept/a.md")).unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.rows()[0].description.as_deref(), Some("theirs"));
}

#[test]
fn pull_propagates_fresh_cache_deletion_of_a_pair() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: related\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.note(
        "concept/b.md",
        "kb-b",
        "  - target: kb-a\n    type: related\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(fx.rows().len(), 2);

    // only one direction deleted in the cache
    fx.db
        .delete_link(&key("kb-a", "kb-b", LinkType::Related), datetime!(2024-05-31 12:00 UTC))
        .unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(report.notes_written, 2);
    assert_eq!(report.cache_deletes, 1);
    assert!(fx.note_links("concept/a.md").is_empty());
    assert!(fx.note_links("concept/b.md").is_empty());
    assert!(fx.rows().is_empty());

    let index = fx.index().expect("index");
    assert!(index.links.is_empty());
    assert_eq!(index.deletions.len(), 2);
}

#[test]
fn pull_stale_deletion_is_a_conflict() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: blocks\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.db
        .delete_link(&key("kb-a", "kb-b", LinkType::Blocks), datetime!(2024-05-01 0:00 UTC))
        .unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::StaleDeletion);
    assert_eq!(fx.note_links("concept/a.md").len(), 1);
    assert!(fx.rows().is_empty());
}

#[test]
fn freshness_window_is_configurable() {
    let fx = Fixture::new();
    fx.note(
        "concept/a.md",
        "kb-a",
        "  - target: kb-b\n    type: blocks\n    created_at: 2024-01-01T00:00:00Z\n",
    );
    fx.db
        .delete_link(&key("kb-a", "kb-b", LinkType::Blocks), datetime!(2024-05-01 0:00 UTC))
        .unwrap();

    let report = fx
        .engine()
        .with_freshness_window(Duration::days(60))
        .pull_from_cache(NOW)
        .unwrap();
    assert!(report.conflicts.is_empty());
    assert!(fx.note_links("concept/a.md").is_empty());
}

#[test]
fn pull_propagates_authoritative_deletion_to_cache() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "");
    fx.db
        .upsert_link(&link("kb-a", "kb-b", LinkType::Blocks, datetime!(2024-01-01 0:00 UTC)))
        .unwrap();
    let index = LinkIndex {
        deletions: vec![Tombstone::new(
            key("kb-a", "kb-b", LinkType::Blocks),
            datetime!(2024-05-31 0:00 UTC),
        )],
        ..LinkIndex::default()
    };
    fx.library.write_index(&index).unwrap();

    let report = fx.engine().pull_from_cache(NOW).unwrap();
    assert_eq!(report.cache_deletes, 1);
    assert!(fx.rows().is_empty());
}

// --- failure isolation and retries ---

/// Delegates to a real library, failing writes to one note and the first
/// few reads of every note.
struct FlakyLibrary {
    inner: FsLibrary,
    broken: Option<NoteLocation>,
    transient_reads: Cell<usize>,
}

impl NoteStore for FlakyLibrary {
    fn list_notes(&self) -> Result<Vec<NoteLocation>> {
        self.inner.list_notes()
    }

    fn read_note(&self, location: &NoteLocation) -> Result<String> {
        if self.transient_reads.get() > 0 {
            self.transient_reads.set(self.transient_reads.get() - 1);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "store unavailable").into());
        }
        self.inner.read_note(location)
    }

    fn write_note(&self, location: &NoteLocation, contents: &str) -> Result<CommitRef> {
        if self.broken.as_ref() == Some(location) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into());
        }
        self.inner.write_note(location, contents)
    }
}

impl LinkIndexStore for FlakyLibrary {
    fn read_index(&self) -> Result<Option<LinkIndex>> {
        self.inner.read_index()
    }

    fn write_index(&self, index: &LinkIndex) -> Result<CommitRef> {
        self.inner.write_index(index)
    }
}

#[test]
fn failed_note_write_does_not_stop_other_notes() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "");
    fx.note("concept/b.md", "kb-b", "");
    fx.db
        .upsert_link(&link("kb-a", "kb-c", LinkType::Blocks, datetime!(2024-02-01 0:00 UTC)))
        .unwrap();
    fx.db
        .upsert_link(&link("kb-b", "kb-c", LinkType::Blocks, datetime!(2024-02-01 0:00 UTC)))
        .unwrap();

    let flaky = FlakyLibrary {
        inner: fx.library.clone(),
        broken: Some(NoteLocation::new("concept/a.md")),
        transient_reads: Cell::new(0),
    };
    let report = SyncEngine::new(&flaky, &flaky, &fx.db)
        .with_policy(RetryPolicy::none())
        .pull_from_cache(NOW)
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].unit, "concept/a.md");
    assert!(!report.failures[0].transient);
    assert_eq!(report.notes_written, 1);
    assert!(fx.note_links("concept/a.md").is_empty());
    assert_eq!(fx.note_links("concept/b.md").len(), 1);

    let index = fx.index().expect("index");
    let keys: Vec<LinkKey> = index.links.iter().map(Link::key).collect();
    assert_eq!(keys, vec![key("kb-b", "kb-c", LinkType::Blocks)]);
}

#[test]
fn transient_read_failures_are_retried() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: blocks\n");

    let flaky = FlakyLibrary {
        inner: fx.library.clone(),
        broken: None,
        transient_reads: Cell::new(2),
    };
    let report = SyncEngine::new(&flaky, &flaky, &fx.db)
        .with_policy(RetryPolicy::immediate(3))
        .push_to_cache(&PushRequest::full_scan(), NOW)
        .unwrap();
    assert!(!report.has_failures());
    assert_eq!(fx.rows().len(), 1);
}

#[test]
fn malformed_index_is_reported_and_left_alone() {
    let fx = Fixture::new();
    fx.note("concept/a.md", "kb-a", "  - target: kb-b\n    type: blocks\n");
    write(fx.dir.path(), "links.json", "{ broken");

    let report = fx.engine().push_to_cache(&PushRequest::full_scan(), NOW).unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].unit, INDEX_FILE);
    assert_eq!(fx.rows().len(), 1);
    assert_eq!(
        fs::read_to_string(fx.dir.path().join("links.json")).unwrap(),
        "{ broken"
    );
}

// --- pure merge and planning ---

#[test]
fn merge_is_commutative() {
    let t0 = datetime!(2024-01-01 0:00 UTC);
    let t1 = datetime!(2024-02-01 0:00 UTC);
    let l1 = vec![
        link("kb-a", "kb-b", LinkType::Related, t0),
        Link::builder("kb-a", "kb-c", LinkType::Supports)
            .description("older")
            .created_at(t0)
            .build(),
        Link::builder("kb-a", "kb-d", LinkType::Blocks)
            .description("left")
            .created_at(t1)
            .build(),
        link("kb-e", "kb-f", LinkType::References, t0),
    ];
    let l2 = vec![
        Link::builder("kb-a", "kb-c", LinkType::Supports)
            .description("newer")
            .created_at(t1)
            .build(),
        Link::builder("kb-a", "kb-d", LinkType::Blocks)
            .description("right")
            .created_at(t1)
            .build(),
        link("kb-g", "kb-h", LinkType::DependsOn, t1),
    ];

    let forward = merge_link_sets(&l1, &l2);
    let backward = merge_link_sets(&l2, &l1);
    assert_eq!(forward, backward);
    assert_eq!(forward.links.len(), 4);
    assert_eq!(
        forward.conflicts,
        BTreeSet::from([key("kb-a", "kb-d", LinkType::Blocks)])
    );
    let supports = forward
        .links
        .iter()
        .find(|l| l.link_type == LinkType::Supports)
        .unwrap();
    assert_eq!(supports.description.as_deref(), Some("newer"));
}

#[test]
fn merge_is_idempotent() {
    let links = vec![link("kb-a", "kb-b", LinkType::Blocks, datetime!(2024-01-01 0:00 UTC))];
    let merged = merge_link_sets(&links, &links);
    assert_eq!(merged.links, links);
    assert!(merged.conflicts.is_empty());
}

#[test]
fn plan_keeps_symmetric_pairs_together() {
    let t0 = datetime!(2024-01-01 0:00 UTC);
    let forward = link("kb-a", "kb-b", LinkType::Contradicts, t0);
    let authoritative = keyed([forward.clone(), forward.mirrored()]);
    let cache = keyed([forward.mirrored()]);
    let cache_deletions = BTreeMap::from([(
        forward.key(),
        Tombstone::new(forward.key(), datetime!(2024-05-31 0:00 UTC)),
    )]);

    let plan = plan_pull(
        &authoritative,
        &cache,
        &BTreeMap::new(),
        &cache_deletions,
        NOW,
        DEFAULT_FRESHNESS_WINDOW,
    );
    assert!(plan.resolved.is_empty());
    assert_eq!(plan.deletions.len(), 2);
    assert!(plan.deletions.contains_key(&forward.key().mirror()));
}

#[test]
fn plan_ignores_tombstones_older_than_the_link() {
    let recreated = link("kb-a", "kb-b", LinkType::Blocks, datetime!(2024-05-31 0:00 UTC));
    let authoritative = keyed([recreated.clone()]);
    let cache_deletions = BTreeMap::from([(
        recreated.key(),
        Tombstone::new(recreated.key(), datetime!(2024-05-01 0:00 UTC)),
    )]);

    let plan = plan_pull(
        &authoritative,
        &BTreeMap::new(),
        &BTreeMap::new(),
        &cache_deletions,
        NOW,
        DEFAULT_FRESHNESS_WINDOW,
    );
    assert_eq!(plan.resolved.get(&recreated.key()), Some(&recreated));
    assert!(plan.conflicts.is_empty());
}
