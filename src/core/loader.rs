// src/core/loader.rs

use crate::core::context::Value;
use log::{debug, trace};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// The exported name→value bindings of one executed module.
pub type Bindings = HashMap<String, Value>;

/// Load results are memoized, so the error type must be cloneable; evaluator
/// failures are flattened to their rendered message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Load cycle detected while requesting module '{path}'.")]
    Cycle { path: String },
    #[error("Module '{path}' failed to load: {message}")]
    Evaluation { path: String, message: String },
}

type LoadResult = Result<Arc<Bindings>, LoadError>;

/// Identity of one logical load chain. A top-level request mints a fresh
/// identity; nested `load` calls issued while evaluating a module body carry
/// the same identity, which is what makes mutual imports detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadChain {
    id: Uuid,
}

impl LoadChain {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for LoadChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to `ModuleSource::evaluate` so a module body can issue nested
/// loads under its own chain identity.
pub struct LoadCtx<'a> {
    chain: LoadChain,
    loader: &'a dyn NestedLoad,
}

impl LoadCtx<'_> {
    pub fn load(&self, path: &Path) -> LoadResult {
        self.loader.load_with_chain(path, &self.chain)
    }
}

impl std::fmt::Debug for LoadCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCtx").field("chain", &self.chain).finish_non_exhaustive()
    }
}

trait NestedLoad: Sync {
    fn load_with_chain(&self, path: &Path, chain: &LoadChain) -> LoadResult;
}

/// The external evaluator collaborator: whatever turns a module file into
/// bindings (an embedded interpreter, a manifest parser, a test stub). The
/// loader itself never looks inside module files.
pub trait ModuleSource: Send + Sync {
    fn evaluate(&self, path: &Path, ctx: &LoadCtx<'_>) -> anyhow::Result<Bindings>;
}

/// One memoized module. The slot starts empty (in-progress) and is filled
/// exactly once; `ready` wakes every thread blocked on the slot.
struct ModuleEntry {
    slot: Mutex<Option<LoadResult>>,
    ready: Condvar,
}

impl ModuleEntry {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn peek(&self) -> Option<LoadResult> {
        self.slot.lock().unwrap().clone()
    }

    fn block_until_ready(&self) -> LoadResult {
        let mut slot = self.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.ready.wait(slot).unwrap();
        }
        slot.clone().unwrap_or_else(|| unreachable!("slot checked above"))
    }

    fn fill(&self, result: LoadResult) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.ready.notify_all();
    }
}

/// Bookkeeping guarded by one short-lived lock. The lock is held only around
/// entry creation/lookup and the cycle walk, never during module-body
/// execution.
#[derive(Default)]
struct LoaderState {
    entries: HashMap<PathBuf, Arc<ModuleEntry>>,
    /// Which chain is currently executing which module path.
    owners: HashMap<PathBuf, Uuid>,
    /// Which path each chain is currently blocked on.
    waiting_on: HashMap<Uuid, PathBuf>,
}

impl LoaderState {
    /// Walks the waits-for chain starting at the owner of `path`. If the
    /// walk ever reaches `requester`, blocking on `path` would deadlock.
    fn would_deadlock(&self, path: &Path, requester: Uuid) -> bool {
        let mut owner = self.owners.get(path);
        while let Some(&chain) = owner {
            if chain == requester {
                return true;
            }
            owner = self
                .waiting_on
                .get(&chain)
                .and_then(|next_path| self.owners.get(next_path));
        }
        false
    }
}

/// A concurrency-safe, deduplicating, cycle-detecting load cache.
///
/// Exactly one execution per module path occurs process-wide, even under
/// concurrent requests; later requests either return the memoized result or
/// block until the in-flight execution signals readiness. A request whose
/// waits-for chain loops back onto itself fails fast with a cycle error
/// instead of blocking.
pub struct ModuleLoader<S> {
    source: S,
    state: Mutex<LoaderState>,
}

impl<S: ModuleSource> std::fmt::Debug for ModuleLoader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader").finish_non_exhaustive()
    }
}

enum Claim {
    Ready(LoadResult),
    MustWait(Arc<ModuleEntry>),
    Execute(Arc<ModuleEntry>),
    Cycle,
}

impl<S: ModuleSource> ModuleLoader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Mutex::new(LoaderState::default()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Resolves `path` to its exported bindings, executing the module body
    /// at most once process-wide. `chain` identifies the logical load chain
    /// of the requester; nested loads issued from a module body inherit it.
    pub fn load(&self, path: &Path, chain: &LoadChain) -> LoadResult {
        // Paths are deduplicated by their canonical form when one exists.
        let path = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        match self.claim(&path, chain) {
            Claim::Ready(result) => {
                trace!("Module '{}' served from cache.", path.display());
                result
            }
            Claim::Cycle => Err(LoadError::Cycle {
                path: path.display().to_string(),
            }),
            Claim::MustWait(entry) => {
                trace!(
                    "Waiting for in-flight load of '{}' (chain {}).",
                    path.display(),
                    chain.id
                );
                let result = entry.block_until_ready();
                self.state.lock().unwrap().waiting_on.remove(&chain.id);
                result
            }
            Claim::Execute(entry) => self.execute(&path, chain, &entry),
        }
    }

    /// Entry lookup/creation and the cycle check, all under one short lock.
    fn claim(&self, path: &Path, chain: &LoadChain) -> Claim {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.get(path).cloned() {
            if let Some(result) = entry.peek() {
                return Claim::Ready(result);
            }
            if state.would_deadlock(path, chain.id) {
                return Claim::Cycle;
            }
            // Record the wait edge before blocking so later cycle walks see
            // this requester in the chain.
            state.waiting_on.insert(chain.id, path.to_path_buf());
            return Claim::MustWait(entry);
        }

        let entry = Arc::new(ModuleEntry::new());
        state.entries.insert(path.to_path_buf(), Arc::clone(&entry));
        state.owners.insert(path.to_path_buf(), chain.id);
        Claim::Execute(entry)
    }

    fn execute(&self, path: &Path, chain: &LoadChain, entry: &Arc<ModuleEntry>) -> LoadResult {
        debug!("Executing module '{}' (chain {}).", path.display(), chain.id);

        // Ownership must be released and waiters woken on every exit path,
        // including an unwinding evaluator.
        let cleanup = scopeguard::guard((), |()| {
            entry.fill(Err(LoadError::Evaluation {
                path: path.display().to_string(),
                message: "module evaluation did not complete".to_string(),
            }));
            self.state.lock().unwrap().owners.remove(path);
        });

        let ctx = LoadCtx {
            chain: chain.clone(),
            loader: self,
        };
        let result = match self.source.evaluate(path, &ctx) {
            Ok(bindings) => Ok(Arc::new(bindings)),
            Err(e) => Err(LoadError::Evaluation {
                path: path.display().to_string(),
                message: format!("{e:#}"),
            }),
        };

        scopeguard::ScopeGuard::into_inner(cleanup);
        entry.fill(result.clone());
        self.state.lock().unwrap().owners.remove(path);
        result
    }
}

impl<S: ModuleSource> NestedLoad for ModuleLoader<S> {
    fn load_with_chain(&self, path: &Path, chain: &LoadChain) -> LoadResult {
        self.load(path, chain)
    }
}
