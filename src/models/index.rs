use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use super::{EntryId, Link, LinkKey, LinkType, Tombstone, normalize_timestamp};

/// Schema version written to the index document.
pub const INDEX_VERSION: u32 = 1;

/// Repository-wide link index document.
///
/// `stats` is derived from `links` and never trusted as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIndex {
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub links: Vec<Link>,
    #[serde(default)]
    pub stats: IndexStats,
    /// Deletions recorded on the authoritative side.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletions: Vec<Tombstone>,
}

impl Default for LinkIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            links: Vec::new(),
            stats: IndexStats::default(),
            deletions: Vec::new(),
        }
    }
}

impl LinkIndex {
    /// Links keyed by identity. Later duplicates lose to newer versions.
    pub fn links_by_key(&self) -> BTreeMap<LinkKey, Link> {
        let mut map: BTreeMap<LinkKey, Link> = BTreeMap::new();
        for link in &self.links {
            let key = link.key();
            let merged = match map.remove(&key) {
                Some(existing) => Link::newer_of(existing, link.clone()),
                None => link.clone(),
            };
            map.insert(key, merged);
        }
        map
    }

    pub fn deletions_by_key(&self) -> BTreeMap<LinkKey, Tombstone> {
        let mut map: BTreeMap<LinkKey, Tombstone> = BTreeMap::new();
        for tomb in &self.deletions {
            let newer = map
                .get(&tomb.key)
                .is_none_or(|existing| tomb.deleted_at > existing.deleted_at);
            if newer {
                map.insert(tomb.key.clone(), tomb.clone());
            }
        }
        map
    }

    /// Same links and deletions, ignoring `updated_at` and `stats`.
    pub fn same_content(&self, other: &LinkIndex) -> bool {
        self.links == other.links && self.deletions == other.deletions
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.updated_at = normalize_timestamp(now);
    }
}

/// Derived statistics over the index links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_links: usize,
    pub by_type: BTreeMap<LinkType, usize>,
    /// Targets with no corresponding note, ascending.
    pub orphaned_targets: Vec<EntryId>,
    /// Most linked-to notes, ties broken by entry id ascending.
    pub most_linked: Vec<LinkedNote>,
}

/// Incoming link count for one note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedNote {
    pub entry_id: EntryId,
    pub incoming: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn index_json_matches_documented_schema() {
        let index = LinkIndex {
            updated_at: datetime!(2024-01-01 0:00 UTC),
            links: vec![
                Link::builder("kb-a", "kb-b", LinkType::Blocks)
                    .created_at(datetime!(2024-01-01 0:00 UTC))
                    .build(),
            ],
            ..LinkIndex::default()
        };
        let json = serde_json::to_value(&index).unwrap();
        assert_eq!(json["version"], INDEX_VERSION);
        assert_eq!(json["links"][0]["type"], "blocks");
        assert!(json["stats"]["by_type"].is_object());
        assert!(json.get("deletions").is_none());
    }

    #[test]
    fn index_without_stats_or_deletions_parses() {
        let json = r#"{"version":1,"updated_at":"2024-01-01T00:00:00Z","links":[]}"#;
        let index: LinkIndex = serde_json::from_str(json).unwrap();
        assert!(index.links.is_empty());
        assert!(index.deletions.is_empty());
    }

    #[test]
    fn duplicate_keys_keep_newer_version() {
        let old = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("old")
            .created_at(datetime!(2024-01-01 0:00 UTC))
            .build();
        let new = Link::builder("kb-a", "kb-b", LinkType::Supports)
            .description("new")
            .created_at(datetime!(2024-06-01 0:00 UTC))
            .build();
        let index = LinkIndex {
            links: vec![new.clone(), old],
            ..LinkIndex::default()
        };
        let map = index.links_by_key();
        assert_eq!(map.len(), 1);
        assert_eq!(map.values().next(), Some(&new));
    }

    #[test]
    fn deletions_keep_latest_tombstone() {
        let key = LinkKey::new("kb-a".into(), "kb-b".into(), LinkType::Related);
        let index = LinkIndex {
            deletions: vec![
                Tombstone::new(key.clone(), datetime!(2024-01-02 0:00 UTC)),
                Tombstone::new(key.clone(), datetime!(2024-01-01 0:00 UTC)),
            ],
            ..LinkIndex::default()
        };
        let map = index.deletions_by_key();
        assert_eq!(map[&key].deleted_at, datetime!(2024-01-02 0:00 UTC));
    }
}
