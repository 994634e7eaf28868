// src/core/cache.rs

use crate::constants::READ_CACHE_CAPACITY;
use crate::core::paths;
use anyhow::Result;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Could not resolve the default store directory: {0}")]
    StoreDir(#[from] paths::PathError),
    #[error("Could not create store directory '{path}': {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not read version entry '{name}': {source}")]
    ReadEntry {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not write version entry '{name}': {source}")]
    WriteEntry {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A canonical version string. Integer fingerprints are folded into their
/// decimal text form, so `42` and `"42"` are the same logical fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl From<i64> for Fingerprint {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl From<u64> for Fingerprint {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

/// Maps a unit name to a stable file name: anything outside `[A-Za-z0-9._-]`
/// is percent-encoded, so the store stays flat with no directory sharding.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// The disk-backed name→version ledger behind skip-if-unchanged semantics.
///
/// One flat file per name; last writer wins. Reads go through a bounded
/// in-memory cache. The `force_out_of_date` flag makes every read behave as
/// if no entry existed, without deleting the stored value — this backs the
/// process-level `--no-cache` override.
pub struct CacheStore {
    dir: PathBuf,
    force_out_of_date: AtomicBool,
    read_cache: Mutex<HashMap<String, String>>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field(
                "force_out_of_date",
                &self.force_out_of_date.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| CacheError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(Self {
            dir,
            force_out_of_date: AtomicBool::new(false),
            read_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Opens the process-wide default store under the per-user cache home.
    pub fn open_default() -> Result<Self, CacheError> {
        Self::open(paths::default_store_dir()?)
    }

    /// When set, every read behaves as "not found". The stored values are
    /// untouched and become visible again once the flag is cleared.
    pub fn set_force_out_of_date(&self, on: bool) {
        self.force_out_of_date.store(on, Ordering::Relaxed);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(encode_name(name))
    }

    /// Returns the last stored version for `name`, or `None` if nothing was
    /// ever stored (or the force-out-of-date override is active).
    pub fn get_version(&self, name: &str) -> Result<Option<String>, CacheError> {
        if self.force_out_of_date.load(Ordering::Relaxed) {
            debug!("Store read for '{name}' masked by force-out-of-date.");
            return Ok(None);
        }

        if let Some(hit) = self.read_cache.lock().unwrap().get(name) {
            return Ok(Some(hit.clone()));
        }

        let path = self.entry_path(name);
        let version = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::ReadEntry {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        self.remember(name, &version);
        Ok(Some(version))
    }

    /// Writes `version` under `name`, overwriting any prior value. The write
    /// goes through a temp file and a rename, so concurrent single-key
    /// writers cannot leave a torn entry behind.
    pub fn set_version(
        &self,
        name: &str,
        version: impl Into<Fingerprint>,
    ) -> Result<(), CacheError> {
        let version = version.into();
        let path = self.entry_path(name);
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let write = |tmp: &Path| -> std::io::Result<()> {
            fs::write(tmp, version.as_str())?;
            fs::rename(tmp, &path)
        };
        if let Err(e) = write(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::WriteEntry {
                name: name.to_string(),
                source: e,
            });
        }

        debug!("Stored version '{version}' for '{name}'.");
        self.remember(name, version.as_str());
        Ok(())
    }

    /// True iff no version is stored for `name`, or the stored version
    /// differs from `version` (string equality over canonical fingerprints).
    pub fn diff(&self, name: &str, version: impl Into<Fingerprint>) -> Result<bool, CacheError> {
        let version = version.into();
        Ok(self.get_version(name)?.as_deref() != Some(version.as_str()))
    }

    /// The memoization primitive: runs `body` only when `version` differs
    /// from the stored one, and records `version` after the body succeeds.
    ///
    /// Returns `Ok(true)` when the body ran, `Ok(false)` when the unit was
    /// already up to date. An error raised by the body propagates and
    /// suppresses the store — no partial-success caching.
    pub fn with_version<F>(
        &self,
        name: &str,
        version: impl Into<Fingerprint>,
        body: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let version = version.into();
        if !self.diff(name, version.clone())? {
            debug!("'{name}' is up to date (version '{version}').");
            return Ok(false);
        }
        body()?;
        self.set_version(name, version)?;
        Ok(true)
    }

    fn remember(&self, name: &str, version: &str) {
        let mut cache = self.read_cache.lock().unwrap();
        if cache.len() >= READ_CACHE_CAPACITY && !cache.contains_key(name) {
            // Bounded cache; eviction order is deliberately arbitrary.
            if let Some(victim) = cache.keys().next().cloned() {
                cache.remove(&victim);
            }
        }
        cache.insert(name.to_string(), version.to_string());
    }
}
