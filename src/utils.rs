//! Shared helpers for locating and opening the link cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Database;

/// Gets the cross-platform cache path.
///
/// Returns the path as `{data_dir}/weft/links.db` where `data_dir` is:
/// - Linux: `~/.local/share`
/// - macOS: `~/Library/Application Support`
/// - Windows: `C:\Users\<user>\AppData\Roaming`
///
/// # Errors
///
/// Returns an error if the data directory cannot be determined.
pub fn get_database_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;

    Ok(data_dir.join("weft").join("links.db"))
}

/// Ensures the parent directory of the cache file exists.
///
/// # Errors
///
/// Returns an error if directory creation fails.
pub fn ensure_database_directory(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    Ok(())
}

/// Opens the cache at `db_path`, creating its directory first.
pub fn open_database(db_path: &Path) -> Result<Database> {
    ensure_database_directory(db_path)?;
    Database::open(db_path)
        .with_context(|| format!("Failed to open link cache: {}", db_path.display()))
}
