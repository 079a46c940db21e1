//! Discovery module: Find the .spp root and the files living inside it

use std::path::{Path, PathBuf};

use crate::{Result, SCHEMA_VERSION, SPP_DIR, SppError};

/// Find the .spp root directory by walking up from the given path.
///
/// Returns the path to the directory containing .spp (not the .spp folder itself).
pub fn find_spp_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.canonicalize()?;

    loop {
        let spp_path = current.join(SPP_DIR);
        if spp_path.is_dir() {
            return Ok(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Err(SppError::NotInRepo),
        }
    }
}

/// Get the .spp directory path for a given root.
pub fn spp_dir(root: &Path) -> PathBuf {
    root.join(SPP_DIR)
}

/// Get the config file path.
pub fn config_path(root: &Path) -> PathBuf {
    spp_dir(root).join("config.json")
}

/// File name of the index database for the current schema version.
pub fn db_file_name() -> String {
    format!("index-v{SCHEMA_VERSION}.db")
}

/// Get the index database path.
pub fn db_path(root: &Path) -> PathBuf {
    spp_dir(root).join(db_file_name())
}

/// List database files left behind by older schema versions.
///
/// Their `-wal`/`-shm`/`.lock` companions are included so that cleanup removes
/// everything in one go.
pub fn stale_stores(root: &Path) -> Result<Vec<PathBuf>> {
    let dir = spp_dir(root);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let current = db_file_name();

    let mut stale = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("index-v") || name.starts_with(&current) {
            continue;
        }
        stale.push(entry.path());
    }
    stale.sort();
    Ok(stale)
}
