// src/core/paths.rs

use crate::constants::{APP_DIR_NAME, STORE_DIR_NAME};
use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

lazy_static! {
    static ref DEFAULT_STORE_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find the per-user cache directory.")]
    CacheHomeNotFound,
    #[error("Could not create store directory at '{path}': {source}")]
    StoreDirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Returns the default version-store directory
/// (`<cache-home>/runbook/store`), creating it if needed.
///
/// The first call computes and caches the path; subsequent calls return the
/// cached value instantly.
pub fn default_store_dir() -> Result<PathBuf, PathError> {
    let mut cached = DEFAULT_STORE_DIR.lock().unwrap();
    if let Some(path) = &*cached {
        return Ok(path.clone());
    }

    let store_path = dirs::cache_dir()
        .ok_or(PathError::CacheHomeNotFound)?
        .join(APP_DIR_NAME)
        .join(STORE_DIR_NAME);

    if !store_path.exists() {
        fs::create_dir_all(&store_path).map_err(|e| PathError::StoreDirCreation {
            path: store_path.display().to_string(),
            source: e,
        })?;
    }

    *cached = Some(store_path.clone());
    Ok(store_path)
}

/// Expands a user-supplied store directory string, resolving the home
/// directory (`~`) and environment variables (`$VAR` / `%VAR%`).
pub fn expand_store_dir(template: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(template)
        .map_err(|e| anyhow!("Failed to expand store path '{}': {}", template, e))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_store_dir_passes_plain_paths_through() {
        let path = expand_store_dir("/tmp/runbook-store").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/runbook-store"));
    }

    #[test]
    fn expand_store_dir_resolves_home() {
        let home = dirs::home_dir().unwrap();
        let path = expand_store_dir("~/stores/runbook").unwrap();
        assert_eq!(path, home.join("stores/runbook"));
    }
}
