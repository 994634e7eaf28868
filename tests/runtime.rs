//! End-to-end runtime flow: manifest loading, dispatch, and cache gating,
//! driven through the public library surface.

use runbook::cli::dispatcher;
use runbook::core::{
    cache::CacheStore,
    loader::{LoadChain, ModuleLoader},
    manifest::ManifestSource,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

fn load_tree(
    manifest: &Path,
    store: &Arc<CacheStore>,
) -> runbook::core::command_tree::CommandSet {
    let loader = ModuleLoader::new(ManifestSource::new(Arc::clone(store)));
    loader.load(manifest, &LoadChain::new()).unwrap();
    loader.into_source().into_command_set()
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| (*t).to_string()).collect()
}

#[test]
fn manifest_tree_with_imports_dispatches_and_gates_on_the_cache() {
    let project = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(store_dir.path()).unwrap());

    write(project.path(), "input.src", "v1 contents");
    write(
        project.path(),
        "runbook.toml",
        r#"
        imports = ["ci.toml"]

        [runbook]
        name = "demo"
        usage = "Integration fixture."

        [commands.build]
        usage = "Build with a gated body."
        run = []
        flags = [{ name = "count", kind = "int", default = 1 }]

        [commands.build.cache]
        key = "build-unit"
        inputs = ["input.src"]
        "#,
    );
    write(
        project.path(),
        "ci.toml",
        r#"
        [commands.lint]
        run = []
        "#,
    );

    let manifest = project.path().join("runbook.toml");
    let set = load_tree(&manifest, &store);

    // Imported command is part of the same tree.
    assert_eq!(set.root().name, "demo");
    assert!(set.resolve(&["lint"]).is_some());

    // First run executes the gated body and records the fingerprint.
    dispatcher::dispatch(&set, &argv(&["build", "--count=3"])).unwrap();
    let first = store.get_version("build-unit").unwrap().unwrap();

    // Second run with unchanged inputs keeps the same fingerprint.
    dispatcher::dispatch(&set, &argv(&["build"])).unwrap();
    assert_eq!(store.get_version("build-unit").unwrap().unwrap(), first);

    // Changing an input changes the stored fingerprint on the next run.
    write(project.path(), "input.src", "v2 contents");
    dispatcher::dispatch(&set, &argv(&["build"])).unwrap();
    let second = store.get_version("build-unit").unwrap().unwrap();
    assert_ne!(second, first);
}

#[test]
fn no_cache_override_reruns_without_erasing_the_ledger() {
    let project = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(store_dir.path()).unwrap());

    write(project.path(), "input.src", "stable");
    write(
        project.path(),
        "runbook.toml",
        r#"
        [runbook]
        name = "demo"

        [commands.build]
        run = []

        [commands.build.cache]
        key = "unit"
        inputs = ["input.src"]
        "#,
    );

    let manifest = project.path().join("runbook.toml");
    let set = load_tree(&manifest, &store);

    dispatcher::dispatch(&set, &argv(&["build"])).unwrap();
    let stored = store.get_version("unit").unwrap().unwrap();

    // With the override on, the read path reports "not found"...
    store.set_force_out_of_date(true);
    assert_eq!(store.get_version("unit").unwrap(), None);
    dispatcher::dispatch(&set, &argv(&["build"])).unwrap();

    // ...but the ledger survives and is visible again afterwards.
    store.set_force_out_of_date(false);
    assert_eq!(store.get_version("unit").unwrap().unwrap(), stored);
}

#[test]
fn unknown_subcommand_path_is_a_resolution_error() {
    let project = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(store_dir.path()).unwrap());

    write(
        project.path(),
        "runbook.toml",
        r#"
        [runbook]
        name = "demo"

        [commands.deploy]
        run = []

        [commands.deploy.subcommands.staging]
        run = []
        "#,
    );

    let manifest = project.path().join("runbook.toml");
    let set = load_tree(&manifest, &store);

    assert!(set.resolve(&["deploy", "staging"]).is_some());
    assert!(set.resolve(&["deploy", "production"]).is_none());
    assert!(dispatcher::dispatch(&set, &argv(&["production"])).is_err());
    assert!(dispatcher::dispatch(&set, &argv(&["deploy", "staging"])).is_ok());
}
