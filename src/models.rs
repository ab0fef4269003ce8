mod category;
mod ids;
mod index;
mod link;
mod link_type;
mod note;

pub use category::{DEFAULT_CATEGORY, category_alias_of, normalize_category};
pub use ids::{EntryId, IdFormat, slugify};
pub use index::{INDEX_VERSION, IndexStats, LinkIndex, LinkedNote};
pub use link::{DEFAULT_CREATED_BY, Link, LinkBuilder, LinkKey, Tombstone, normalize_timestamp};
pub use link_type::{Direction, LinkType};
pub use note::{
    ALT_ID_KEY, CATEGORY_KEY, CONTENT_HASH_KEY, FRONTMATTER_PROVENANCE, FrontmatterLink, ID_KEY,
    LINKS_KEY, Note, NoteLocation, TITLE_KEY,
};
