use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use time::{OffsetDateTime, UtcOffset};

use super::{EntryId, LinkType};

/// Provenance recorded when no explicit producer is given.
pub const DEFAULT_CREATED_BY: &str = "weft";

/// Identity of a link: at most one link per key exists in any store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    #[serde(rename = "source_entry_id")]
    pub source: EntryId,
    #[serde(rename = "target_entry_id")]
    pub target: EntryId,
    #[serde(rename = "type")]
    pub link_type: LinkType,
}

impl LinkKey {
    pub fn new(source: EntryId, target: EntryId, link_type: LinkType) -> Self {
        Self {
            source,
            target,
            link_type,
        }
    }

    /// The key of the reverse-direction link of the same type.
    pub fn mirror(&self) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
            link_type: self.link_type,
        }
    }

    pub fn touches(&self, id: &EntryId) -> bool {
        &self.source == id || &self.target == id
    }

    /// Rewrites every occurrence of `old` in the key's endpoints.
    pub fn renamed(&self, old: &EntryId, new: &EntryId) -> Self {
        let swap = |id: &EntryId| if id == old { new.clone() } else { id.clone() };
        Self::new(swap(&self.source), swap(&self.target), self.link_type)
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.link_type, self.target)
    }
}

/// A typed edge between two notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source_entry_id: EntryId,
    pub target_entry_id: EntryId,
    #[serde(rename = "type")]
    pub link_type: LinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
}

impl Link {
    /// Starts building a link with the required identity fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use weft::{Link, LinkType};
    ///
    /// let link = Link::builder("kb-a", "kb-b", LinkType::Related)
    ///     .description("same topic")
    ///     .created_by("cli")
    ///     .build();
    ///
    /// assert_eq!(link.key().mirror().source.as_str(), "kb-b");
    /// ```
    pub fn builder(
        source: impl Into<EntryId>,
        target: impl Into<EntryId>,
        link_type: LinkType,
    ) -> LinkBuilder {
        LinkBuilder {
            source: source.into(),
            target: target.into(),
            link_type,
            description: None,
            created_at: None,
            created_by: None,
            auto_detected: None,
            match_type: None,
        }
    }

    pub fn key(&self) -> LinkKey {
        LinkKey::new(
            self.source_entry_id.clone(),
            self.target_entry_id.clone(),
            self.link_type,
        )
    }

    pub fn is_self_link(&self) -> bool {
        self.source_entry_id == self.target_entry_id
    }

    /// The reverse-direction copy carrying the same attributes.
    pub fn mirrored(&self) -> Link {
        Link {
            source_entry_id: self.target_entry_id.clone(),
            target_entry_id: self.source_entry_id.clone(),
            ..self.clone()
        }
    }

    /// Compares the optional payload fields. Provenance is not content.
    pub fn same_content(&self, other: &Link) -> bool {
        self.description == other.description
            && self.auto_detected == other.auto_detected
            && self.match_type == other.match_type
    }

    /// Total order used by keyed merges: newer `created_at` wins, remaining
    /// fields break ties so the merge is commutative.
    pub fn recency_cmp(&self, other: &Link) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.description.cmp(&other.description))
            .then_with(|| self.auto_detected.cmp(&other.auto_detected))
            .then_with(|| self.match_type.cmp(&other.match_type))
            .then_with(|| self.created_by.cmp(&other.created_by))
    }

    /// Returns whichever of two versions of the same key ranks newer.
    pub fn newer_of(a: Link, b: Link) -> Link {
        if b.recency_cmp(&a) == Ordering::Greater {
            b
        } else {
            a
        }
    }

    /// Rewrites every occurrence of `old` in the link's endpoints.
    pub fn renamed(&self, old: &EntryId, new: &EntryId) -> Link {
        let mut link = self.clone();
        if &link.source_entry_id == old {
            link.source_entry_id = new.clone();
        }
        if &link.target_entry_id == old {
            link.target_entry_id = new.clone();
        }
        link
    }
}

/// Builder for [`Link`] with optional fields.
#[derive(Debug)]
pub struct LinkBuilder {
    source: EntryId,
    target: EntryId,
    link_type: LinkType,
    description: Option<String>,
    created_at: Option<OffsetDateTime>,
    created_by: Option<String>,
    auto_detected: Option<bool>,
    match_type: Option<String>,
}

impl LinkBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn maybe_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn auto_detected(mut self, match_type: impl Into<String>) -> Self {
        self.auto_detected = Some(true);
        self.match_type = Some(match_type.into());
        self
    }

    /// Builds the link. Timestamps are normalized to whole UTC seconds.
    pub fn build(self) -> Link {
        Link {
            source_entry_id: self.source,
            target_entry_id: self.target,
            link_type: self.link_type,
            description: self.description,
            created_at: normalize_timestamp(self.created_at.unwrap_or_else(OffsetDateTime::now_utc)),
            created_by: self
                .created_by
                .unwrap_or_else(|| DEFAULT_CREATED_BY.to_string()),
            auto_detected: self.auto_detected,
            match_type: self.match_type,
        }
    }
}

/// Record that a link was deleted, used by the deletion freshness window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    #[serde(flatten)]
    pub key: LinkKey,
    #[serde(with = "time::serde::rfc3339")]
    pub deleted_at: OffsetDateTime,
}

impl Tombstone {
    pub fn new(key: LinkKey, deleted_at: OffsetDateTime) -> Self {
        Self {
            key,
            deleted_at: normalize_timestamp(deleted_at),
        }
    }
}

/// Truncates to whole seconds in UTC. Every store keeps second resolution.
pub fn normalize_timestamp(at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(UtcOffset::UTC);
    at.replace_nanosecond(0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn builder_fills_defaults() {
        let link = Link::builder("kb-a", "kb-b", LinkType::Blocks).build();
        assert_eq!(link.created_by, DEFAULT_CREATED_BY);
        assert_eq!(link.description, None);
        assert_eq!(link.created_at.nanosecond(), 0);
    }

    #[test]
    fn mirror_swaps_endpoints_only() {
        let link = Link::builder("kb-a", "kb-b", LinkType::Related)
            .description("shared")
            .created_at(datetime!(2024-03-01 10:00 UTC))
            .build();
        let mirror = link.mirrored();
        assert_eq!(mirror.key(), link.key().mirror());
        assert_eq!(mirror.description, link.description);
        assert_eq!(mirror.created_at, link.created_at);
    }

    #[test]
    fn newer_of_is_commutative() {
        let old = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("old")
            .created_at(datetime!(2024-01-01 0:00 UTC))
            .build();
        let new = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("new")
            .created_at(datetime!(2024-02-01 0:00 UTC))
            .build();
        assert_eq!(Link::newer_of(old.clone(), new.clone()), new);
        assert_eq!(Link::newer_of(new.clone(), old), new);
    }

    #[test]
    fn newer_of_breaks_timestamp_ties_deterministically() {
        let at = datetime!(2024-01-01 0:00 UTC);
        let a = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("alpha")
            .created_at(at)
            .build();
        let b = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("beta")
            .created_at(at)
            .build();
        assert_eq!(Link::newer_of(a.clone(), b.clone()), Link::newer_of(b, a));
    }

    #[test]
    fn timestamps_truncate_to_utc_seconds() {
        let at = datetime!(2024-05-05 12:30:45.987 +02:00);
        assert_eq!(normalize_timestamp(at), datetime!(2024-05-05 10:30:45 UTC));
    }

    #[test]
    fn link_serializes_type_field() {
        let link = Link::builder("kb-a", "kb-b", LinkType::DependsOn)
            .created_at(datetime!(2024-01-01 0:00 UTC))
            .build();
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(json["type"], "depends_on");
        assert_eq!(json["created_at"], "2024-01-01T00:00:00Z");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn renamed_rewrites_both_endpoints() {
        let link = Link::builder("kb-a", "kb-b", LinkType::References).build();
        let old = EntryId::new("kb-b");
        let new = EntryId::new("library.concept.b");
        let renamed = link.renamed(&old, &new);
        assert_eq!(renamed.target_entry_id, new);
        assert_eq!(renamed.source_entry_id.as_str(), "kb-a");
    }

    #[test]
    fn tombstone_flattens_key() {
        let key = LinkKey::new("kb-a".into(), "kb-b".into(), LinkType::Related);
        let tomb = Tombstone::new(key, datetime!(2024-01-01 0:00 UTC));
        let json = serde_json::to_value(&tomb).unwrap();
        assert_eq!(json["source_entry_id"], "kb-a");
        assert_eq!(json["type"], "related");
    }
}
