// src/core/manifest.rs

use crate::core::{
    cache::CacheStore,
    command_tree::{CommandSet, CommandSpec, TreeError, ValueDecl},
    context::{Value, ValueKind},
    loader::{Bindings, LoadCtx, ModuleSource},
    orchestrator,
};
use crate::system::executor;
use anyhow::{Context, Result};
use colored::Colorize;
use log::info;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Could not read manifest '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse manifest '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Unknown kind '{kind}' for declaration '{name}'. Expected one of: str, int, bool, str_list, int_list.")]
    UnknownKind { kind: String, name: String },
    #[error("Default for '{name}' does not fit its declared kind '{kind}'.")]
    BadDefault { name: String, kind: String },
    #[error("Variable '{name}' has an unsupported value type.")]
    BadVar { name: String },
    #[error(transparent)]
    Tree(#[from] TreeError),
}

// --- TOML document model ---

/// A command body: either a single line or a sequence of lines.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Runnable {
    Single(String),
    Sequence(Vec<String>),
}

impl Runnable {
    fn into_lines(self) -> Vec<String> {
        match self {
            Self::Single(line) => vec![line],
            Self::Sequence(lines) => lines,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CacheGate {
    /// The named unit in the version store this command is gated on.
    pub key: String,
    /// Files whose contents make up the unit's fingerprint.
    pub inputs: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeclEntry {
    pub name: String,
    pub kind: String,
    pub default: Option<toml::Value>,
    pub usage: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CommandEntry {
    pub usage: Option<String>,
    pub category: Option<String>,
    pub run: Option<Runnable>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub flags: Vec<DeclEntry>,
    #[serde(default)]
    pub args: Vec<DeclEntry>,
    pub cache: Option<CacheGate>,
    #[serde(default)]
    pub subcommands: BTreeMap<String, CommandEntry>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RunbookMeta {
    pub name: String,
    pub usage: Option<String>,
}

/// One parsed `runbook.toml` document.
#[derive(Deserialize, Debug, Clone)]
pub struct ManifestDoc {
    pub runbook: Option<RunbookMeta>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandEntry>,
}

impl ManifestDoc {
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str_named(&text, &path.display().to_string())
    }

    pub fn from_str_named(text: &str, origin: &str) -> Result<Self, ManifestError> {
        toml::from_str(text).map_err(|e| ManifestError::Parse {
            path: origin.to_string(),
            source: e,
        })
    }
}

// --- Declaration projection ---

fn parse_kind(entry: &DeclEntry) -> Result<ValueKind, ManifestError> {
    match entry.kind.as_str() {
        "str" | "string" => Ok(ValueKind::Str),
        "int" => Ok(ValueKind::Int),
        "bool" => Ok(ValueKind::Bool),
        "str_list" => Ok(ValueKind::StrList),
        "int_list" => Ok(ValueKind::IntList),
        other => Err(ManifestError::UnknownKind {
            kind: other.to_string(),
            name: entry.name.clone(),
        }),
    }
}

fn toml_to_value(name: &str, kind: ValueKind, raw: &toml::Value) -> Result<Value, ManifestError> {
    let bad = || ManifestError::BadDefault {
        name: name.to_string(),
        kind: kind.label().to_string(),
    };
    match (kind, raw) {
        (ValueKind::Str, toml::Value::String(s)) => Ok(Value::Str(s.clone())),
        (ValueKind::Int, toml::Value::Integer(i)) => Ok(Value::Int(*i)),
        (ValueKind::Bool, toml::Value::Boolean(b)) => Ok(Value::Bool(*b)),
        (ValueKind::StrList, toml::Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::StrList),
        (ValueKind::IntList, toml::Value::Array(items)) => items
            .iter()
            .map(|v| v.as_integer().ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::IntList),
        _ => Err(bad()),
    }
}

fn project_decl(entry: &DeclEntry) -> Result<ValueDecl, ManifestError> {
    let kind = parse_kind(entry)?;
    let mut decl = ValueDecl::new(entry.name.clone(), kind);
    if let Some(raw) = &entry.default {
        decl = decl.default_value(toml_to_value(&entry.name, kind, raw)?);
    }
    if let Some(usage) = &entry.usage {
        decl = decl.usage(usage.clone());
    }
    Ok(decl)
}

/// Untyped module variables become loader bindings.
fn vars_to_bindings(vars: &BTreeMap<String, toml::Value>) -> Result<Bindings, ManifestError> {
    let mut bindings = Bindings::new();
    for (name, raw) in vars {
        let bad = || ManifestError::BadVar { name: name.clone() };
        let value = match raw {
            toml::Value::String(s) => Value::Str(s.clone()),
            toml::Value::Integer(i) => Value::Int(*i),
            toml::Value::Boolean(b) => Value::Bool(*b),
            toml::Value::Array(items) => {
                if items.iter().all(|v| v.is_integer()) {
                    Value::IntList(items.iter().filter_map(|v| v.as_integer()).collect())
                } else {
                    Value::StrList(
                        items
                            .iter()
                            .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
                            .collect::<Result<Vec<_>, _>>()?,
                    )
                }
            }
            _ => return Err(bad()),
        };
        bindings.insert(name.clone(), value);
    }
    Ok(bindings)
}

// --- Fingerprinting ---

const HASH_TRUNCATE_LENGTH: usize = 16; // 16 bytes = 32 hex characters

/// Hashes the contents of the gate's input files into one fingerprint.
/// Inputs are hashed in their declared order; a missing input is an error
/// (the gate cannot decide "up to date" without it).
pub fn fingerprint_inputs(base_dir: &Path, inputs: &[String]) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    for input in inputs {
        let path = base_dir.join(input);
        let content = std::fs::read(&path)
            .with_context(|| format!("Failed to read cache input '{}'", path.display()))?;
        hasher.update(input.as_bytes());
        hasher.update(&content);
    }
    let hash = hasher.finalize();
    Ok(hex::encode(&hash.as_bytes()[..HASH_TRUNCATE_LENGTH]))
}

// --- Action plan ---

/// Everything a manifest-declared action needs at invocation time.
struct ActionPlan {
    lines: Vec<String>,
    parallel: bool,
    cache: Option<CacheGate>,
    base_dir: PathBuf,
    env: HashMap<String, String>,
    store: Arc<CacheStore>,
}

impl ActionPlan {
    fn invoke(&self) -> Result<()> {
        match &self.cache {
            Some(gate) => {
                let fingerprint = fingerprint_inputs(&self.base_dir, &gate.inputs)?;
                let ran = self
                    .store
                    .with_version(&gate.key, fingerprint, || self.run_lines())?;
                if !ran {
                    info!("'{}' is up to date, skipping.", gate.key);
                    println!("{}", format!("✓ '{}' is up to date.", gate.key).dimmed());
                }
                Ok(())
            }
            None => self.run_lines(),
        }
    }

    fn run_lines(&self) -> Result<()> {
        if self.parallel {
            let pool = orchestrator::global().pool();
            for line in &self.lines {
                let line = line.clone();
                let base_dir = self.base_dir.clone();
                let env = self.env.clone();
                pool.run(move || {
                    executor::execute_line(&line, &base_dir, &env).map_err(Into::into)
                });
            }
            pool.wait();
            Ok(())
        } else {
            for line in &self.lines {
                println!("{} {}", "→".blue(), line.green());
                executor::execute_line(line, &self.base_dir, &self.env)?;
            }
            Ok(())
        }
    }
}

// --- Registration ---

fn build_spec(
    entry: &CommandEntry,
    base_dir: &Path,
    env: &BTreeMap<String, String>,
    store: &Arc<CacheStore>,
) -> Result<CommandSpec, ManifestError> {
    let plan = Arc::new(ActionPlan {
        lines: entry.run.clone().map(Runnable::into_lines).unwrap_or_default(),
        parallel: entry.parallel,
        cache: entry.cache.clone(),
        base_dir: base_dir.to_path_buf(),
        env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        store: Arc::clone(store),
    });

    let mut spec = CommandSpec::new(Arc::new(move |_ctx| plan.invoke()));
    if let Some(usage) = &entry.usage {
        spec = spec.usage(usage.clone());
    }
    if let Some(category) = &entry.category {
        spec = spec.category(category.clone());
    }
    for flag in &entry.flags {
        spec = spec.flag(project_decl(flag)?);
    }
    for arg in &entry.args {
        spec = spec.arg(project_decl(arg)?);
    }
    Ok(spec)
}

fn register_entry(
    set: &mut CommandSet,
    path: &mut Vec<String>,
    name: &str,
    entry: &CommandEntry,
    base_dir: &Path,
    env: &BTreeMap<String, String>,
    store: &Arc<CacheStore>,
) -> Result<(), ManifestError> {
    let spec = build_spec(entry, base_dir, env, store)?;
    path.push(name.to_string());
    {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        set.declare_subcommand(&segments, spec)?;
    }
    for (child_name, child) in &entry.subcommands {
        register_entry(set, path, child_name, child, base_dir, env, store)?;
    }
    path.pop();
    Ok(())
}

/// Registers a parsed manifest into the command set. Root metadata is only
/// applied by the first manifest that declares it, so imported manifests
/// cannot rename the root.
pub fn register_manifest(
    set: &mut CommandSet,
    doc: &ManifestDoc,
    base_dir: &Path,
    store: &Arc<CacheStore>,
) -> Result<(), ManifestError> {
    if let Some(meta) = &doc.runbook
        && set.root().name.is_empty()
    {
        set.declare_root(meta.name.clone(), meta.usage.clone());
    }
    for (name, entry) in &doc.commands {
        let mut path = Vec::new();
        register_entry(set, &mut path, name, entry, base_dir, &doc.env, store)?;
    }
    Ok(())
}

// --- The binary's ModuleSource ---

/// Evaluates manifest files: parses the TOML, registers its commands into a
/// shared command set, resolves its imports through the loader (nested loads
/// carry the requesting chain), and exports its `vars` as bindings.
pub struct ManifestSource {
    set: Mutex<CommandSet>,
    store: Arc<CacheStore>,
}

impl std::fmt::Debug for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestSource").finish_non_exhaustive()
    }
}

impl ManifestSource {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            set: Mutex::new(CommandSet::new()),
            store,
        }
    }

    pub fn into_command_set(self) -> CommandSet {
        self.set.into_inner().unwrap()
    }
}

impl ModuleSource for ManifestSource {
    fn evaluate(&self, path: &Path, ctx: &LoadCtx<'_>) -> Result<Bindings> {
        let doc = ManifestDoc::from_path(path)?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        // Register this manifest's own commands first, then release the set
        // lock before recursing into imports (a nested evaluate call locks
        // the set again).
        {
            let mut set = self.set.lock().unwrap();
            register_manifest(&mut set, &doc, &base_dir, &self.store)?;
        }

        for import in &doc.imports {
            ctx.load(&base_dir.join(import))
                .with_context(|| format!("While importing '{import}'"))?;
        }

        Ok(vars_to_bindings(&doc.vars)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loader::{LoadChain, LoadError, ModuleLoader};
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Arc<CacheStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::open(dir.path()).unwrap());
        (dir, store)
    }

    const BASIC: &str = r#"
        [runbook]
        name = "demo"
        usage = "A demo tool."

        [commands.build]
        usage = "Build the project."
        run = ["echo building"]
        flags = [{ name = "count", kind = "int", default = 1 }]

        [commands.deploy]
        run = "echo deploying"

        [commands.deploy.subcommands.staging]
        run = "echo deploying to staging"
    "#;

    #[test]
    fn registers_commands_and_subcommands() {
        let (_dir, store) = test_store();
        let doc = ManifestDoc::from_str_named(BASIC, "test").unwrap();
        let mut set = CommandSet::new();
        register_manifest(&mut set, &doc, Path::new("."), &store).unwrap();

        assert_eq!(set.root().name, "demo");
        let build = set.resolve(&["build"]).unwrap();
        assert_eq!(build.flags.len(), 1);
        assert_eq!(build.flags[0].name, "count");
        assert!(set.resolve(&["deploy", "staging"]).is_some());
    }

    #[test]
    fn unknown_kind_is_fatal_at_registration() {
        let (_dir, store) = test_store();
        let doc = ManifestDoc::from_str_named(
            r#"
            [commands.build]
            run = "echo hi"
            flags = [{ name = "mode", kind = "enum" }]
            "#,
            "test",
        )
        .unwrap();
        let mut set = CommandSet::new();
        let err = register_manifest(&mut set, &doc, Path::new("."), &store).unwrap_err();
        assert!(matches!(err, ManifestError::UnknownKind { .. }));
    }

    #[test]
    fn default_must_match_declared_kind() {
        let (_dir, store) = test_store();
        let doc = ManifestDoc::from_str_named(
            r#"
            [commands.build]
            run = "echo hi"
            flags = [{ name = "count", kind = "int", default = "three" }]
            "#,
            "test",
        )
        .unwrap();
        let mut set = CommandSet::new();
        let err = register_manifest(&mut set, &doc, Path::new("."), &store).unwrap_err();
        assert!(matches!(err, ManifestError::BadDefault { .. }));
    }

    #[test]
    fn fingerprint_tracks_input_contents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.src"), "fn main() {}").unwrap();
        let inputs = vec!["main.src".to_string()];

        let first = fingerprint_inputs(dir.path(), &inputs).unwrap();
        let again = fingerprint_inputs(dir.path(), &inputs).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.len(), HASH_TRUNCATE_LENGTH * 2);

        std::fs::write(dir.path().join("main.src"), "fn main() { changed }").unwrap();
        let changed = fingerprint_inputs(dir.path(), &inputs).unwrap();
        assert_ne!(first, changed);
    }

    #[test]
    fn missing_fingerprint_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let inputs = vec!["absent.src".to_string()];
        assert!(fingerprint_inputs(dir.path(), &inputs).is_err());
    }

    #[test]
    fn imports_merge_commands_and_export_vars() {
        let (_dir, store) = test_store();
        let project = TempDir::new().unwrap();
        std::fs::write(
            project.path().join("runbook.toml"),
            r#"
            imports = ["shared.toml"]

            [runbook]
            name = "root"

            [commands.build]
            run = "echo root build"
            "#,
        )
        .unwrap();
        std::fs::write(
            project.path().join("shared.toml"),
            r#"
            [vars]
            region = "eu-west-1"
            replicas = 3

            [commands.lint]
            run = "echo lint"
            "#,
        )
        .unwrap();

        let loader = ModuleLoader::new(ManifestSource::new(store));
        loader
            .load(&project.path().join("runbook.toml"), &LoadChain::new())
            .unwrap();

        let set = loader.into_source().into_command_set();
        assert_eq!(set.root().name, "root");
        assert!(set.resolve(&["build"]).is_some());
        assert!(set.resolve(&["lint"]).is_some());
    }

    #[test]
    fn import_cycles_surface_the_loader_error() {
        let (_dir, store) = test_store();
        let project = TempDir::new().unwrap();
        std::fs::write(
            project.path().join("a.toml"),
            "imports = [\"b.toml\"]\n",
        )
        .unwrap();
        std::fs::write(
            project.path().join("b.toml"),
            "imports = [\"a.toml\"]\n",
        )
        .unwrap();

        let loader = ModuleLoader::new(ManifestSource::new(store));
        let err = loader
            .load(&project.path().join("a.toml"), &LoadChain::new())
            .unwrap_err();
        let LoadError::Evaluation { message, .. } = &err else {
            unreachable!("expected evaluation error, got {err:?}");
        };
        assert!(message.contains("cycle"), "unexpected message: {message}");
    }
}
