//! Terminal rendering of validation, recovery, sync and link reports.
//!
//! JSON is the default CLI output; these printers back `--format text`.

use std::fmt::Write;

use crate::error::UnitFailure;
use crate::recovery::{RecoveryReport, StepReport};
use crate::service::{LinkOutcome, NoteLinks};
use crate::store::CachedLink;
use crate::sync::{ConflictKind, SyncReport};
use crate::validator::{DefectCategory, ValidationReport};

// ANSI color codes for terminal output
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

/// Defects listed per category before the rest are summarised.
const MAX_LISTED: usize = 10;

/// Health of one report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, HealthStatus::Ok)
    }

    fn symbol(self) -> &'static str {
        match self {
            HealthStatus::Ok => "\u{2713}",
            HealthStatus::Warning => "!",
            HealthStatus::Error => "\u{2717}",
        }
    }

    fn color(self) -> &'static str {
        match self {
            HealthStatus::Ok => GREEN,
            HealthStatus::Warning => YELLOW,
            HealthStatus::Error => RED,
        }
    }
}

fn status_line(out: &mut String, status: HealthStatus, text: &str) {
    let _ = writeln!(out, "  {}{}{} {}", status.color(), status.symbol(), RESET, text);
}

fn failures_section(out: &mut String, title: &str, failures: &[UnitFailure]) {
    if failures.is_empty() {
        return;
    }
    let _ = writeln!(out, "  {}{}{} ({})", BOLD, title, RESET, failures.len());
    for failure in failures {
        let retry = if failure.transient { " (transient)" } else { "" };
        let _ = writeln!(
            out,
            "    {}{}{}: {}{}",
            DIM, failure.unit, RESET, failure.error, retry
        );
    }
}

// ============================================================================
// Validation
// ============================================================================

pub fn render_validation(report: &ValidationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}weft validate{}", BOLD, RESET);
    if let Some(tenant) = &report.tenant {
        let _ = writeln!(out, "  {}Tenant: {}{}", DIM, tenant, RESET);
    }
    let _ = writeln!(out);

    let stats = &report.stats;
    let _ = writeln!(out, "{}Library{}", BOLD, RESET);
    let _ = writeln!(out, "  Notes:      {:>6} scanned", stats.notes_scanned);
    if stats.malformed_notes > 0 || stats.unreadable_notes > 0 {
        let _ = writeln!(
            out,
            "              {:>6} malformed {:>6} unreadable",
            stats.malformed_notes, stats.unreadable_notes
        );
    }
    let _ = writeln!(
        out,
        "  Links:      {:>6} frontmatter {:>6} index {:>6} cache",
        stats.frontmatter_links, stats.index_links, stats.cache_links
    );
    if !stats.categories.is_empty() {
        let categories: Vec<String> = stats
            .categories
            .iter()
            .map(|(name, count)| format!("{name} ({count})"))
            .collect();
        let _ = writeln!(out, "  Categories: {}", categories.join(", "));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "{}Defects{}", BOLD, RESET);
    if report.is_clean() {
        status_line(&mut out, HealthStatus::Ok, "No defects found");
        return out;
    }
    for category in DefectCategory::ALL {
        let count = report.count(category);
        let status = if count == 0 { HealthStatus::Ok } else { HealthStatus::Warning };
        status_line(&mut out, status, &format!("{}: {}", category.as_str(), count));
        for defect in report.of(category).take(MAX_LISTED) {
            let place = defect
                .location
                .as_ref()
                .map(|l| l.to_string())
                .unwrap_or_else(|| {
                    defect
                        .entry_ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                });
            let _ = writeln!(out, "      {}{}{}: {}", DIM, place, RESET, defect.detail);
        }
        if count > MAX_LISTED {
            let _ = writeln!(out, "      {}... and {} more{}", DIM, count - MAX_LISTED, RESET);
        }
    }
    out
}

pub fn print_validation(report: &ValidationReport) {
    print!("{}", render_validation(report));
}

// ============================================================================
// Recovery
// ============================================================================

pub fn render_step(report: &StepReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { " (dry run)" } else { "" };
    let _ = writeln!(out, "{}{}{}{}", BOLD, report.step, mode, RESET);

    if report.skipped {
        status_line(&mut out, HealthStatus::Warning, "Skipped");
        return out;
    }

    let status = if !report.failures.is_empty() {
        HealthStatus::Error
    } else if !report.unresolved.is_empty() || !report.deferred.is_empty() {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    };
    let verb = if report.dry_run { "would modify" } else { "modified" };
    status_line(
        &mut out,
        status,
        &format!("{} processed, {} {}", report.processed, verb, report.modified),
    );

    for change in &report.changes {
        let commit = change
            .commit
            .as_ref()
            .map(|c| format!(" [{c}]"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "    {}{}{}: {}{}",
            DIM, change.location, RESET, change.detail, commit
        );
    }
    if !report.deferred.is_empty() {
        let _ = writeln!(out, "  {}Deferred{} ({})", BOLD, RESET, report.deferred.len());
        for location in &report.deferred {
            let _ = writeln!(out, "    {}{}{}", DIM, location, RESET);
        }
    }
    failures_section(&mut out, "Unresolved", &report.unresolved);
    failures_section(&mut out, "Failed", &report.failures);

    if let Some(validation) = &report.validation {
        let _ = writeln!(out);
        out.push_str(&render_validation(validation));
    }
    out
}

pub fn render_recovery(report: &RecoveryReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { " (dry run)" } else { "" };
    let _ = writeln!(out, "{}weft full_recovery{}{}", BOLD, mode, RESET);
    if let Some(tenant) = &report.tenant {
        let _ = writeln!(out, "  {}Tenant: {}{}", DIM, tenant, RESET);
    }
    for step in &report.steps {
        let _ = writeln!(out);
        out.push_str(&render_step(step));
    }
    out
}

pub fn print_step(report: &StepReport) {
    print!("{}", render_step(report));
}

pub fn print_recovery(report: &RecoveryReport) {
    print!("{}", render_recovery(report));
}

// ============================================================================
// Sync
// ============================================================================

pub fn render_sync(direction: &str, report: &SyncReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}weft {}{}", BOLD, direction, RESET);

    let status = if report.has_failures() {
        HealthStatus::Error
    } else if !report.conflicts.is_empty() || report.deferred > 0 || !report.deferred_notes.is_empty() {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    };
    status_line(
        &mut out,
        status,
        &format!(
            "{} notes, {} links considered",
            report.notes_scanned, report.links_considered
        ),
    );
    let _ = writeln!(
        out,
        "    Cache:  {:>6} upserted {:>6} deleted {:>6} deferred",
        report.cache_upserts, report.cache_deletes, report.deferred
    );
    let _ = writeln!(out, "    Notes:  {:>6} written", report.notes_written);
    if let Some(commit) = &report.index_commit {
        let _ = writeln!(out, "    {}Index commit: {}{}", DIM, commit, RESET);
    }

    if !report.conflicts.is_empty() {
        let _ = writeln!(out, "  {}Conflicts{} ({})", BOLD, RESET, report.conflicts.len());
        for conflict in &report.conflicts {
            let kind = match conflict.kind {
                ConflictKind::EqualTimestamps => "equal timestamps",
                ConflictKind::StaleDeletion => "stale deletion",
            };
            let _ = writeln!(out, "    {}{}{}: {}", DIM, conflict.key, RESET, kind);
        }
    }
    if !report.deferred_notes.is_empty() {
        let _ = writeln!(out, "  {}Renaming{} ({})", BOLD, RESET, report.deferred_notes.len());
        for location in &report.deferred_notes {
            let _ = writeln!(out, "    {}{}{}", DIM, location, RESET);
        }
    }
    failures_section(&mut out, "Failed", &report.failures);
    out
}

pub fn print_sync(direction: &str, report: &SyncReport) {
    print!("{}", render_sync(direction, report));
}

// ============================================================================
// Links
// ============================================================================

pub fn render_link_outcome(action: &str, outcome: &LinkOutcome) -> String {
    let mut out = String::new();
    let status = if outcome.failures.is_empty() {
        HealthStatus::Ok
    } else {
        HealthStatus::Warning
    };
    status_line(
        &mut out,
        status,
        &format!("{} {} link(s), {} note(s) written", action, outcome.keys.len(), outcome.commits.len()),
    );
    for key in &outcome.keys {
        let _ = writeln!(out, "    {}{}{}", DIM, key, RESET);
    }
    failures_section(&mut out, "Failed", &outcome.failures);
    out
}

fn link_row(out: &mut String, row: &CachedLink, other: &str) {
    let link = &row.link;
    let description = link
        .description
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default();
    let _ = writeln!(
        out,
        "    {:<14} {}{}{}{}",
        link.link_type.as_str(),
        other,
        DIM,
        description,
        RESET
    );
}

pub fn render_note_links(entry_id: &str, links: &NoteLinks) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}{}{}", BOLD, entry_id, RESET);
    let _ = writeln!(out, "  Outgoing ({})", links.outgoing.len());
    for row in &links.outgoing {
        link_row(&mut out, row, row.link.target_entry_id.as_str());
    }
    let _ = writeln!(out, "  Incoming ({})", links.incoming.len());
    for row in &links.incoming {
        link_row(&mut out, row, row.link.source_entry_id.as_str());
    }
    out
}
