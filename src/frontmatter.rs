//! Frontmatter codec for note files.
//!
//! A note file is one or more `---` delimited YAML blocks followed by a
//! markdown body. More than one block is corruption left behind by earlier
//! writers; the parser keeps every block so recovery can merge them.

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::error::{LinkError, Result};
use crate::models::{CONTENT_HASH_KEY, FrontmatterLink, LINKS_KEY};

/// Line delimiting a frontmatter block.
pub const MARKER: &str = "---";

/// Length of the hex content hash prefix.
const CONTENT_HASH_LEN: usize = 16;

/// A note file split into its frontmatter blocks and body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNote {
    pub blocks: Vec<Mapping>,
    pub body: String,
}

impl ParsedNote {
    /// Splits `raw` into frontmatter blocks and body.
    ///
    /// A first block that is not a YAML mapping, or that is never closed, is a
    /// [`LinkError::StructuralParse`]. A later block that does not parse as a
    /// mapping is treated as the start of the body.
    pub fn parse(location: &str, raw: &str) -> Result<Self> {
        let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
        let mut blocks = Vec::new();
        let mut remaining = text;

        loop {
            if !starts_with_marker(remaining) {
                break;
            }
            let Some((yaml, after)) = split_block(remaining) else {
                if blocks.is_empty() {
                    return Err(LinkError::structural(location, "unterminated frontmatter block"));
                }
                break;
            };

            let first = blocks.is_empty();
            let mapping = match serde_yaml::from_str::<Value>(yaml) {
                Ok(Value::Mapping(mapping)) => mapping,
                Ok(Value::Null) if first => Mapping::new(),
                _ if !first => break,
                Ok(other) => {
                    return Err(LinkError::structural(
                        location,
                        format!("frontmatter is not a mapping: {other:?}"),
                    ));
                }
                Err(e) => {
                    return Err(LinkError::structural(location, format!("invalid YAML: {e}")));
                }
            };

            blocks.push(mapping);
            remaining = trim_blank_lines(after);
        }

        Ok(Self {
            blocks,
            body: remaining.to_string(),
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_duplicated(&self) -> bool {
        self.blocks.len() > 1
    }

    /// The effective frontmatter: first block wins, later blocks add keys.
    pub fn merged(&self) -> Mapping {
        merge_blocks(&self.blocks)
    }

    pub fn has_body(&self) -> bool {
        !self.body.trim().is_empty()
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.body)
    }

    /// Renders the note with its `links` array replaced.
    ///
    /// The array is written into the block that declared it (the first block
    /// otherwise) and stripped from later blocks. Every other key, the block
    /// structure and the body are left as they were.
    pub fn render_with_links(&self, links: &[FrontmatterLink]) -> Result<String> {
        let mut blocks = self.blocks.clone();
        if blocks.is_empty() {
            blocks.push(Mapping::new());
        }
        let target = blocks
            .iter()
            .position(|block| block.contains_key(LINKS_KEY))
            .unwrap_or(0);
        for (i, block) in blocks.iter_mut().enumerate() {
            if i == target {
                set_links(block, links)?;
            } else {
                block.shift_remove(LINKS_KEY);
            }
        }
        render_blocks(&blocks, &self.body)
    }
}

/// Merges frontmatter blocks, keeping the first block's value for any key
/// present in several blocks and appending keys only found in later ones.
pub fn merge_blocks(blocks: &[Mapping]) -> Mapping {
    let mut merged = blocks.first().cloned().unwrap_or_default();
    for block in blocks.iter().skip(1) {
        for (key, value) in block {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Renders a single frontmatter block followed by the body.
pub fn render(frontmatter: &Mapping, body: &str) -> Result<String> {
    render_blocks(std::slice::from_ref(frontmatter), body)
}

/// Renders every block in order followed by the body.
pub fn render_blocks(blocks: &[Mapping], body: &str) -> Result<String> {
    let mut out = String::new();
    for block in blocks {
        let yaml = if block.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(block)?
        };
        out.push_str(MARKER);
        out.push('\n');
        out.push_str(&yaml);
        out.push_str(MARKER);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(trim_blank_lines(body));
    Ok(out)
}

/// First 16 hex chars of the SHA-256 of the trimmed body.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..CONTENT_HASH_LEN].to_string()
}

/// Replaces the reserved `links` array, keeping its position among the keys.
/// An empty list removes the key.
pub fn set_links(frontmatter: &mut Mapping, links: &[FrontmatterLink]) -> Result<()> {
    if links.is_empty() {
        frontmatter.shift_remove(LINKS_KEY);
        return Ok(());
    }
    let value = serde_yaml::to_value(links)?;
    frontmatter.insert(Value::String(LINKS_KEY.to_string()), value);
    Ok(())
}

pub fn set_string(frontmatter: &mut Mapping, key: &str, value: &str) {
    frontmatter.insert(
        Value::String(key.to_string()),
        Value::String(value.to_string()),
    );
}

pub fn set_content_hash(frontmatter: &mut Mapping, hash: &str) {
    set_string(frontmatter, CONTENT_HASH_KEY, hash);
}

fn starts_with_marker(text: &str) -> bool {
    let first_line = text.lines().next().unwrap_or("");
    first_line.trim_end() == MARKER
}

/// Returns the YAML between an opening marker line and the next closing
/// marker line, plus everything after the closing line.
fn split_block(text: &str) -> Option<(&str, &str)> {
    let opening_end = text.find('\n')?;
    let rest = &text[opening_end + 1..];
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == MARKER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn trim_blank_lines(text: &str) -> &str {
    text.trim_start_matches(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Note, NoteLocation};

    #[test]
    fn parses_single_block() {
        let parsed = ParsedNote::parse("a.md", "---\nid: kb-a\ntitle: A\n---\n\n# A\nbody\n").unwrap();
        assert_eq!(parsed.block_count(), 1);
        assert_eq!(parsed.body, "# A\nbody\n");
        assert!(parsed.has_body());
        assert!(!parsed.is_duplicated());
    }

    #[test]
    fn detects_double_frontmatter() {
        let raw = "---\nid: kb-a\ntitle: First\n---\n---\ntitle: Second\nsource: chat\n---\nbody";
        let parsed = ParsedNote::parse("a.md", raw).unwrap();
        assert_eq!(parsed.block_count(), 2);
        assert_eq!(parsed.body, "body");

        let merged = parsed.merged();
        assert_eq!(merged.get("title").and_then(Value::as_str), Some("First"));
        assert_eq!(merged.get("source").and_then(Value::as_str), Some("chat"));
    }

    #[test]
    fn merged_keeps_first_block_key_order() {
        let raw = "---\nb: 1\na: 2\n---\n---\nc: 3\na: 9\n---\n";
        let merged = ParsedNote::parse("a.md", raw).unwrap().merged();
        let keys: Vec<&str> = merged.keys().filter_map(Value::as_str).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn horizontal_rule_in_body_is_not_a_block() {
        let raw = "---\nid: kb-a\n---\n---\nJust prose here.\n---\nmore";
        let parsed = ParsedNote::parse("a.md", raw).unwrap();
        assert_eq!(parsed.block_count(), 1);
        assert!(parsed.body.starts_with("---\nJust prose"));
    }

    #[test]
    fn note_without_frontmatter_has_no_blocks() {
        let parsed = ParsedNote::parse("a.md", "# Heading\ntext").unwrap();
        assert!(parsed.blocks.is_empty());
        assert_eq!(parsed.body, "# Heading\ntext");
    }

    #[test]
    fn unterminated_block_is_structural_error() {
        let err = ParsedNote::parse("a.md", "---\nid: kb-a\nbody").unwrap_err();
        assert!(matches!(err, LinkError::StructuralParse { .. }));
    }

    #[test]
    fn non_mapping_first_block_is_structural_error() {
        let err = ParsedNote::parse("a.md", "---\n- one\n- two\n---\nbody").unwrap_err();
        assert!(matches!(err, LinkError::StructuralParse { .. }));
    }

    #[test]
    fn render_then_parse_is_stable() {
        let raw = "---\nid: kb-a\ntitle: A\n---\n---\nextra: yes\n---\n\nbody text\n";
        let parsed = ParsedNote::parse("a.md", raw).unwrap();
        let rendered = render(&parsed.merged(), &parsed.body).unwrap();
        let reparsed = ParsedNote::parse("a.md", &rendered).unwrap();
        assert_eq!(reparsed.block_count(), 1);
        assert_eq!(reparsed.body, parsed.body);
        assert_eq!(render(&reparsed.merged(), &reparsed.body).unwrap(), rendered);
    }

    #[test]
    fn content_hash_ignores_surrounding_whitespace() {
        assert_eq!(content_hash("body\n"), content_hash("  body  "));
        assert_eq!(content_hash("body").len(), 16);
        assert_ne!(content_hash("body"), content_hash("other"));
    }

    #[test]
    fn content_hash_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        assert_eq!(content_hash("abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn render_with_links_keeps_duplicate_blocks() {
        let raw = "---\nid: kb-a\n---\n---\nlinks:\n  - target: kb-b\n    type: blocks\n---\nbody";
        let parsed = ParsedNote::parse("concept/a.md", raw).unwrap();
        let link = FrontmatterLink {
            target: "kb-c".into(),
            link_type: crate::models::LinkType::Supports,
            description: None,
            created_at: None,
            auto_detected: None,
            match_type: None,
        };
        let rendered = parsed.render_with_links(&[link]).unwrap();
        let reparsed = ParsedNote::parse("concept/a.md", &rendered).unwrap();
        assert_eq!(reparsed.block_count(), 2);
        assert_eq!(reparsed.body, "body");
        let note = Note::from_frontmatter(NoteLocation::new("concept/a.md"), &reparsed.merged()).unwrap();
        assert_eq!(note.outgoing_links.len(), 1);
        assert_eq!(note.outgoing_links[0].target.as_str(), "kb-c");
    }

    #[test]
    fn set_links_replaces_in_place_and_removes_when_empty() {
        let raw = "---\nid: kb-a\nlinks:\n  - target: kb-b\n    type: related\ntitle: A\n---\nbody";
        let parsed = ParsedNote::parse("concept/a.md", raw).unwrap();
        let mut fm = parsed.merged();
        let note = Note::from_frontmatter(NoteLocation::new("concept/a.md"), &fm).unwrap();

        let mut links = note.outgoing_links.clone();
        links[0].description = Some("updated".into());
        set_links(&mut fm, &links).unwrap();
        let keys: Vec<&str> = fm.keys().filter_map(Value::as_str).collect();
        assert_eq!(keys, vec!["id", "links", "title"]);

        set_links(&mut fm, &[]).unwrap();
        assert!(!fm.contains_key(LINKS_KEY));
    }
}
