use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest slug derived from a title.
const MAX_SLUG_LEN: usize = 50;

/// Globally unique identifier of a note.
///
/// Canonical form is `[tenant.]library.{category}.{slug}`; the legacy form
/// `kb-` followed by 8 hex characters is recognized but non-canonical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

/// Shape of an entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFormat {
    Canonical,
    Legacy,
    Malformed,
}

impl EntryId {
    /// Creates an entry id from any string. Format is not checked.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the canonical id for a note.
    ///
    /// # Examples
    ///
    /// ```
    /// use weft::EntryId;
    ///
    /// let id = EntryId::canonical(None, "concept", "My Concept");
    /// assert_eq!(id.as_str(), "library.concept.my-concept");
    ///
    /// let id = EntryId::canonical(Some("acme"), "concept", "My Concept");
    /// assert_eq!(id.as_str(), "acme.library.concept.my-concept");
    /// ```
    pub fn canonical(tenant: Option<&str>, category: &str, title: &str) -> Self {
        let category = slugify(category);
        let slug = slugify(title);
        match tenant.filter(|t| !t.is_empty()) {
            Some(tenant) => Self(format!("{tenant}.library.{category}.{slug}")),
            None => Self(format!("library.{category}.{slug}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classifies the id as canonical, legacy or malformed.
    pub fn format(&self) -> IdFormat {
        if is_legacy(&self.0) {
            IdFormat::Legacy
        } else if is_canonical(&self.0) {
            IdFormat::Canonical
        } else {
            IdFormat::Malformed
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.format() == IdFormat::Canonical
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Derives a URL-safe slug from a title.
///
/// Lower-cases, collapses runs of characters outside `[a-z0-9]` into a single
/// `-`, truncates and trims dashes. Falls back to `untitled`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.to_string()
    }
}

fn is_legacy(id: &str) -> bool {
    id.strip_prefix("kb-")
        .is_some_and(|hex| hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_canonical(id: &str) -> bool {
    let parts: Vec<&str> = id.split('.').collect();
    let (tenant, rest) = match parts.len() {
        3 => (None, &parts[..]),
        4 => (Some(parts[0]), &parts[1..]),
        _ => return false,
    };
    if let Some(tenant) = tenant
        && !is_segment(tenant, true)
    {
        return false;
    }
    rest[0] == "library" && is_segment(rest[1], false) && is_segment(rest[2], false)
}

fn is_segment(segment: &str, allow_underscore: bool) -> bool {
    !segment.is_empty()
        && segment.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_underscore && c == '_')
        })
}
