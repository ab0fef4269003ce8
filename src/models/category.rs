/// Category used when neither frontmatter nor location names one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Known categories and the spellings accepted for each.
///
/// The table is fixed; unknown folder names are never fuzzy-matched.
const CATEGORY_ALIASES: &[(&str, &[&str])] = &[
    ("concept", &["concepts"]),
    ("epiphany", &["epiphanies", "epiphanys"]),
    ("reflection", &["reflections"]),
    ("glimmer", &["glimmers"]),
    ("reminder", &["reminders"]),
    ("worklog", &["worklogs"]),
    ("tech-thought", &["tech-thoughts", "tech-thoughtss"]),
    ("research-topic", &["research-topics", "research-topicss"]),
    ("theology", &["theologies", "theologys"]),
    ("agent-thought", &["agent-thoughts"]),
    ("article-idea", &["article-ideas"]),
    ("writing", &["writings"]),
    ("procedure", &["procedures"]),
    ("reference", &["references"]),
];

/// Maps a category or folder name to its canonical singular form.
///
/// # Examples
///
/// ```
/// use weft::models::normalize_category;
///
/// assert_eq!(normalize_category("Tech-Thoughtss"), "tech-thought");
/// assert_eq!(normalize_category("concept"), "concept");
/// assert_eq!(normalize_category("poetry"), "poetry");
/// assert_eq!(normalize_category(""), "general");
/// ```
pub fn normalize_category(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return DEFAULT_CATEGORY.to_string();
    }
    canonical_for_alias(&lowered)
        .map(str::to_string)
        .unwrap_or(lowered)
}

/// Returns the canonical category when `name` is an accepted non-canonical
/// spelling (plural or typo) of a known category.
pub fn category_alias_of(name: &str) -> Option<&'static str> {
    canonical_for_alias(&name.trim().to_lowercase())
}

fn canonical_for_alias(lowered: &str) -> Option<&'static str> {
    CATEGORY_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&lowered))
        .map(|(canonical, _)| *canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plurals_map_to_singular() {
        assert_eq!(normalize_category("concepts"), "concept");
        assert_eq!(normalize_category("Reflections"), "reflection");
        assert_eq!(normalize_category("epiphanies"), "epiphany");
    }

    #[test]
    fn typos_map_to_canonical() {
        assert_eq!(category_alias_of("research-topicss"), Some("research-topic"));
        assert_eq!(category_alias_of("theologys"), Some("theology"));
    }

    #[test]
    fn canonical_names_are_not_aliases() {
        assert_eq!(category_alias_of("concept"), None);
    }

    #[test]
    fn unknown_names_pass_through_lowercased() {
        assert_eq!(normalize_category("Poetry"), "poetry");
        assert_eq!(category_alias_of("poetrys"), None);
    }
}
