//! Filesystem-backed authoritative store.
//!
//! Notes live at `{root}/{folder}/{name}.md`; the link index is the JSON
//! document `{root}/links.json`. Every write goes to a temporary file in the
//! target directory and is renamed into place, so readers never observe a
//! partially written note.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use walkdir::{DirEntry, WalkDir};

use super::{CommitRef, LinkIndexStore, NoteStore};
use crate::error::{LinkError, Result};
use crate::models::{LinkIndex, NoteLocation};

/// File name of the link index document at the library root.
pub const INDEX_FILE: &str = "links.json";

const NOTE_EXTENSION: &str = "md";

/// A note library rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsLibrary {
    root: PathBuf,
}

impl FsLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn note_path(&self, location: &NoteLocation) -> Result<PathBuf> {
        let escapes = location
            .as_str()
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
        if escapes {
            return Err(LinkError::structural(
                location.as_str(),
                "note location must be a relative path inside the library",
            ));
        }
        Ok(self.root.join(location.as_str()))
    }
}

impl NoteStore for FsLibrary {
    /// Lists every note below a storage grouping, sorted by location.
    ///
    /// Hidden files and directories, `README.md` files and files directly at
    /// the root are not notes.
    fn list_notes(&self) -> Result<Vec<NoteLocation>> {
        let mut notes = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));

        for entry in walker {
            let entry = entry.map_err(|e| {
                LinkError::from(
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop in library")),
                )
            })?;
            if entry.depth() < 2
                || !entry.file_type().is_file()
                || !is_note_file(entry.path())
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let location: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            notes.push(NoteLocation::new(location.join("/")));
        }

        notes.sort();
        Ok(notes)
    }

    fn read_note(&self, location: &NoteLocation) -> Result<String> {
        let path = self.note_path(location)?;
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LinkError::NotFound(location.to_string()),
            _ => LinkError::from(e),
        })
    }

    fn write_note(&self, location: &NoteLocation, contents: &str) -> Result<CommitRef> {
        let path = self.note_path(location)?;
        atomic_write(&path, contents.as_bytes())
    }
}

impl LinkIndexStore for FsLibrary {
    fn read_index(&self) -> Result<Option<LinkIndex>> {
        let raw = match fs::read_to_string(self.index_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let index = serde_json::from_str(&raw)
            .map_err(|e| LinkError::structural(INDEX_FILE, format!("invalid link index: {e}")))?;
        Ok(Some(index))
    }

    fn write_index(&self, index: &LinkIndex) -> Result<CommitRef> {
        let mut json = serde_json::to_string_pretty(index)?;
        json.push('\n');
        atomic_write(&self.index_path(), json.as_bytes())
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn is_note_file(path: &Path) -> bool {
    let is_markdown = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(NOTE_EXTENSION));
    let is_readme = path
        .file_name()
        .is_some_and(|name| name.eq_ignore_ascii_case("README.md"));
    is_markdown && !is_readme
}

/// Writes `bytes` to `path` through a temporary sibling file and a rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<CommitRef> {
    let dir = path
        .parent()
        .ok_or_else(|| LinkError::NotFound(path.display().to_string()))?;
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| LinkError::from(e.error))?;

    Ok(commit_ref(bytes))
}

fn commit_ref(bytes: &[u8]) -> CommitRef {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    CommitRef(digest[..16].to_string())
}
