// src/constants.rs

/// The name of the per-user directory holding runbook state (under the
/// platform cache home, e.g. `~/.cache/runbook`).
pub const APP_DIR_NAME: &str = "runbook";

/// The sub-directory of the app dir that holds the version store.
pub const STORE_DIR_NAME: &str = "store";

/// The default manifest file name looked up in the working directory.
pub const MANIFEST_FILENAME: &str = "runbook.toml";

/// Upper bound on entries held by the version store's in-memory read cache.
pub const READ_CACHE_CAPACITY: usize = 256;
