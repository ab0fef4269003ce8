pub mod config;
pub mod db;
pub mod doctor;
pub mod error;
pub mod frontmatter;
pub mod graph;
pub mod library;
pub mod models;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod store;
pub mod sync;
pub mod utils;
pub mod validator;

pub use config::Config;
pub use db::Database;
pub use error::{LinkError, Result, UnitFailure};
pub use graph::LinkGraph;
pub use library::LibrarySnapshot;
pub use models::{
    EntryId, FrontmatterLink, IdFormat, Link, LinkIndex, LinkKey, LinkType, Note, NoteLocation,
    Tombstone,
};
pub use recovery::{Exclusivity, RecoveryEngine, RecoveryOptions, RecoveryReport, RecoveryStep, StepReport};
pub use retry::RetryPolicy;
pub use service::{LinkOutcome, LinkRequest, LinkService, NoteLinks};
pub use store::{CachedLink, CommitRef, FsLibrary, LinkCache, LinkFilter, LinkIndexStore, NoteStore};
pub use sync::{PushRequest, SyncEngine, SyncReport, TypeSelection};
pub use validator::{DefectCategory, ValidationReport};
