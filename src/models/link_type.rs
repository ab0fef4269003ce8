use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LinkError;

/// Relationship type of a link between two notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Related,
    DependsOn,
    Blocks,
    Implements,
    References,
    Contradicts,
    Supports,
}

/// Whether a link type requires its mirror to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// A→B implies B→A of the same type.
    Symmetric,
    /// Exists in one direction only.
    Directed,
}

impl LinkType {
    pub const ALL: [LinkType; 7] = [
        LinkType::Related,
        LinkType::DependsOn,
        LinkType::Blocks,
        LinkType::Implements,
        LinkType::References,
        LinkType::Contradicts,
        LinkType::Supports,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::DependsOn => "depends_on",
            Self::Blocks => "blocks",
            Self::Implements => "implements",
            Self::References => "references",
            Self::Contradicts => "contradicts",
            Self::Supports => "supports",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Self::Related | Self::Contradicts => Direction::Symmetric,
            _ => Direction::Directed,
        }
    }

    pub fn is_symmetric(self) -> bool {
        self.direction() == Direction::Symmetric
    }

    /// Types pushed to the cache in real time rather than on the periodic scan.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Implements | Self::Blocks)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| LinkError::UnknownLinkType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_related_and_contradicts_are_symmetric() {
        let symmetric: Vec<LinkType> = LinkType::ALL
            .into_iter()
            .filter(|t| t.is_symmetric())
            .collect();
        assert_eq!(symmetric, vec![LinkType::Related, LinkType::Contradicts]);
    }

    #[test]
    fn critical_types_are_implements_and_blocks() {
        assert!(LinkType::Implements.is_critical());
        assert!(LinkType::Blocks.is_critical());
        assert!(!LinkType::Related.is_critical());
    }

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&LinkType::DependsOn).unwrap(),
            r#""depends_on""#
        );
        let parsed: LinkType = serde_json::from_str(r#""contradicts""#).unwrap();
        assert_eq!(parsed, LinkType::Contradicts);
    }

    #[test]
    fn from_str_rejects_unknown_types() {
        assert_eq!("blocks".parse::<LinkType>().unwrap(), LinkType::Blocks);
        assert!(matches!(
            "inspires".parse::<LinkType>(),
            Err(LinkError::UnknownLinkType(_))
        ));
    }

    #[test]
    fn display_matches_wire_name() {
        for t in LinkType::ALL {
            assert_eq!(t.to_string(), t.as_str());
        }
    }
}
