//! Default locations for the database and CSV files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const FALLBACK_DB_FILE: &str = "calibration.db";
const DB_EXTENSION: &str = "db";
const CSV_EXTENSION: &str = "csv";

/// Pick the database to open.
///
/// An explicit path (flag or `CALDB_DB`) wins. Otherwise the first `*.db` file
/// in `cwd` by name is used, and failing that `calibration.db` in `cwd`.
///
/// # Errors
/// Returns an error when `cwd` cannot be listed.
pub fn resolve_db_path(explicit: Option<PathBuf>, cwd: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let entries = fs::read_dir(cwd)
        .with_context(|| format!("failed to list working directory {}", cwd.display()))?;

    let mut databases = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", cwd.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == DB_EXTENSION) {
            databases.push(path);
        }
    }
    databases.sort();

    Ok(databases
        .into_iter()
        .next()
        .unwrap_or_else(|| cwd.join(FALLBACK_DB_FILE)))
}

/// The database path with its extension swapped for `.csv`.
#[must_use]
pub fn default_csv_path(db_path: &Path) -> PathBuf {
    db_path.with_extension(CSV_EXTENSION)
}

/// # Errors
/// Returns an error when the parent directory cannot be created.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display())),
        _ => Ok(()),
    }
}
