use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use time::OffsetDateTime;

use super::{EntryId, Link, LinkType, normalize_category, normalize_timestamp};
use crate::error::{LinkError, Result};

/// Frontmatter key holding the entry id.
pub const ID_KEY: &str = "id";
/// Older notes spell the id key out in full.
pub const ALT_ID_KEY: &str = "entry_id";
pub const TITLE_KEY: &str = "title";
pub const CATEGORY_KEY: &str = "category";
pub const CONTENT_HASH_KEY: &str = "content_hash";
/// Reserved frontmatter array of outgoing links.
pub const LINKS_KEY: &str = "links";

/// Provenance given to links read from note frontmatter.
pub const FRONTMATTER_PROVENANCE: &str = "library";

/// Location of a note file relative to the library root, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteLocation(String);

impl NoteLocation {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The storage grouping (first path component), if the note is in one.
    pub fn folder(&self) -> Option<&str> {
        let (folder, _) = self.0.split_once('/')?;
        Some(folder)
    }

    /// File name without directories or the `.md` extension.
    pub fn stem(&self) -> &str {
        let name = self.0.rsplit('/').next().unwrap_or(&self.0);
        name.strip_suffix(".md").unwrap_or(name)
    }
}

impl fmt::Display for NoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a note's frontmatter `links` array.
///
/// The source is implied by the note that carries the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontmatterLink {
    pub target: EntryId,
    #[serde(rename = "type")]
    pub link_type: LinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
}

impl FrontmatterLink {
    /// Expands the entry into a full link owned by `source`.
    ///
    /// Entries without `created_at` are treated as created at the Unix epoch,
    /// so any timestamped version of the same key is newer.
    pub fn to_link(&self, source: &EntryId) -> Link {
        Link {
            source_entry_id: source.clone(),
            target_entry_id: self.target.clone(),
            link_type: self.link_type,
            description: self.description.clone(),
            created_at: normalize_timestamp(self.created_at.unwrap_or(OffsetDateTime::UNIX_EPOCH)),
            created_by: FRONTMATTER_PROVENANCE.to_string(),
            auto_detected: self.auto_detected,
            match_type: self.match_type.clone(),
        }
    }

    pub fn from_link(link: &Link) -> Self {
        Self {
            target: link.target_entry_id.clone(),
            link_type: link.link_type,
            description: link.description.clone(),
            created_at: Some(link.created_at),
            auto_detected: link.auto_detected,
            match_type: link.match_type.clone(),
        }
    }

    pub fn matches(&self, target: &EntryId, link_type: LinkType) -> bool {
        &self.target == target && self.link_type == link_type
    }
}

/// Structural view of a note: the frontmatter fields the link graph needs.
///
/// Built without reading the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub location: NoteLocation,
    pub entry_id: Option<EntryId>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub content_hash: Option<String>,
    /// Outgoing links in frontmatter order.
    pub outgoing_links: Vec<FrontmatterLink>,
}

impl Note {
    /// Reads the structural fields from a (merged) frontmatter mapping.
    pub fn from_frontmatter(location: NoteLocation, frontmatter: &Mapping) -> Result<Self> {
        let outgoing_links = match frontmatter.get(LINKS_KEY) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
                LinkError::structural(location.as_str(), format!("invalid links array: {e}"))
            })?,
        };

        Ok(Self {
            entry_id: string_field(frontmatter, ID_KEY)
                .or_else(|| string_field(frontmatter, ALT_ID_KEY))
                .map(EntryId::new),
            title: string_field(frontmatter, TITLE_KEY),
            category: string_field(frontmatter, CATEGORY_KEY),
            content_hash: string_field(frontmatter, CONTENT_HASH_KEY),
            outgoing_links,
            location,
        })
    }

    /// Outgoing links as full links. Self-links are never materialized.
    pub fn links(&self) -> Vec<Link> {
        let Some(source) = &self.entry_id else {
            return Vec::new();
        };
        self.outgoing_links
            .iter()
            .filter(|entry| {
                if &entry.target == source {
                    tracing::warn!(note = %self.location, "ignoring self-link in frontmatter");
                    false
                } else {
                    true
                }
            })
            .map(|entry| entry.to_link(source))
            .collect()
    }

    /// Canonical category of the folder the note is stored in.
    pub fn folder_category(&self) -> Option<String> {
        self.location.folder().map(normalize_category)
    }

    /// Declared category, falling back to the folder.
    pub fn effective_category(&self) -> String {
        match &self.category {
            Some(category) => normalize_category(category),
            None => self
                .folder_category()
                .unwrap_or_else(|| normalize_category("")),
        }
    }

    /// Title from frontmatter, else the file stem without a date prefix.
    pub fn display_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let stem = self.location.stem();
        strip_date_prefix(stem).replace('-', " ")
    }
}

fn string_field(frontmatter: &Mapping, key: &str) -> Option<String> {
    match frontmatter.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn strip_date_prefix(stem: &str) -> &str {
    let bytes = stem.as_bytes();
    let has_prefix = bytes.len() > 11
        && bytes[..10].iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
        && bytes[10] == b'-';
    if has_prefix { &stem[11..] } else { stem }
}
