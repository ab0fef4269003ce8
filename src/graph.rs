//! In-memory link graph with symmetric-pair semantics.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{LinkError, Result};
use crate::models::{EntryId, IndexStats, Link, LinkKey, LinkedNote};

/// Number of entries reported in [`IndexStats::most_linked`].
pub const MOST_LINKED_LIMIT: usize = 10;

/// Links keyed by `(source, target, type)`.
///
/// Every mutation keeps symmetric types paired: adding `A -[related]-> B`
/// also adds `B -[related]-> A`, and removing either removes both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkGraph {
    links: BTreeMap<LinkKey, Link>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from stored links as-is, without adding mirrors.
    ///
    /// Duplicate keys keep the newer version; self-links are dropped.
    pub fn from_links<I>(links: I) -> Self
    where
        I: IntoIterator<Item = Link>,
    {
        let mut graph = Self::new();
        for link in links {
            if link.is_self_link() {
                tracing::warn!(link = %link.key(), "dropping self-link");
                continue;
            }
            graph.merge(link);
        }
        graph
    }

    /// Adds a link, and its mirror for symmetric types.
    ///
    /// Rejects self-links and keys that already exist. For symmetric types
    /// either both directions are inserted or neither.
    pub fn add_link(&mut self, link: Link) -> Result<Link> {
        if link.is_self_link() {
            return Err(LinkError::SelfLink(link.source_entry_id));
        }
        let key = link.key();
        if self.links.contains_key(&key) {
            return Err(LinkError::DuplicateLink(key));
        }
        if link.link_type.is_symmetric() {
            let mirror = key.mirror();
            if self.links.contains_key(&mirror) {
                return Err(LinkError::DuplicateLink(mirror));
            }
            self.links.insert(mirror, link.mirrored());
        }
        self.links.insert(key, link.clone());
        Ok(link)
    }

    /// Removes a link and, for symmetric types, its mirror. Missing links are
    /// not an error. Returns the links actually removed.
    pub fn remove_link(&mut self, key: &LinkKey) -> Vec<Link> {
        let mut removed = Vec::new();
        if let Some(link) = self.links.remove(key) {
            removed.push(link);
        }
        if key.link_type.is_symmetric()
            && let Some(mirror) = self.links.remove(&key.mirror())
        {
            removed.push(mirror);
        }
        removed
    }

    /// Inserts or replaces by key, keeping whichever version is newer.
    pub fn merge(&mut self, link: Link) {
        let key = link.key();
        let merged = match self.links.remove(&key) {
            Some(existing) => Link::newer_of(existing, link),
            None => link,
        };
        self.links.insert(key, merged);
    }

    pub fn get(&self, key: &LinkKey) -> Option<&Link> {
        self.links.get(key)
    }

    pub fn contains(&self, key: &LinkKey) -> bool {
        self.links.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links in key order.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn into_links(self) -> Vec<Link> {
        self.links.into_values().collect()
    }

    pub fn outgoing<'a>(&'a self, id: &'a EntryId) -> impl Iterator<Item = &'a Link> + 'a {
        self.links
            .values()
            .filter(move |link| &link.source_entry_id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a EntryId) -> impl Iterator<Item = &'a Link> + 'a {
        self.links
            .values()
            .filter(move |link| &link.target_entry_id == id)
    }

    /// Symmetric links whose mirror is absent.
    pub fn missing_mirrors(&self) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|(key, _)| key.link_type.is_symmetric() && !self.links.contains_key(&key.mirror()))
            .map(|(_, link)| link)
            .collect()
    }
}

/// Returns the fully mirrored, deduplicated set of `links` in key order.
///
/// Both directions of a symmetric pair end up carrying the newer of the two
/// versions, so the result does not depend on which direction was declared.
pub fn expand_symmetric(links: &[Link]) -> Vec<Link> {
    let mut graph = LinkGraph::new();
    for link in links {
        if link.is_self_link() {
            tracing::warn!(link = %link.key(), "dropping self-link");
            continue;
        }
        if link.link_type.is_symmetric() {
            graph.merge(link.mirrored());
        }
        graph.merge(link.clone());
    }
    graph.into_links()
}

/// Derives index statistics from `links` alone.
///
/// `known_ids` are the notes that exist; any other target is orphaned.
pub fn compute_stats(links: &[Link], known_ids: &BTreeSet<EntryId>, top_n: usize) -> IndexStats {
    let mut stats = IndexStats {
        total_links: links.len(),
        ..IndexStats::default()
    };
    let mut incoming: BTreeMap<&EntryId, usize> = BTreeMap::new();
    let mut orphaned: BTreeSet<&EntryId> = BTreeSet::new();

    for link in links {
        *stats.by_type.entry(link.link_type).or_insert(0) += 1;
        *incoming.entry(&link.target_entry_id).or_insert(0) += 1;
        if !known_ids.contains(&link.target_entry_id) {
            orphaned.insert(&link.target_entry_id);
        }
    }

    let mut ranked: Vec<(&EntryId, usize)> = incoming.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    stats.most_linked = ranked
        .into_iter()
        .take(top_n)
        .map(|(id, count)| LinkedNote {
            entry_id: id.clone(),
            incoming: count,
        })
        .collect();
    stats.orphaned_targets = orphaned.into_iter().cloned().collect();
    stats
}
