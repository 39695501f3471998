//! Loads the `hello_native` demo library through the native backend.
//!
//! The library is built with the same toolchain that runs this test, into a
//! private target directory, then copied into a temporary search root.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use kiln::host::{Context, Engine, LocalEngine};
use kiln::plugins::PluginManager;
use kiln::{Config, SearchPath};
use serde_json::json;
use tempfile::tempdir;

fn build_hello_native() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/plugins/Cargo.toml");
    let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("native-plugins");
    let status = Command::new(env!("CARGO"))
        .arg("build")
        .arg("--manifest-path")
        .arg(&manifest)
        .args(["-p", "kiln-plugin-hello-native"])
        .arg("--target-dir")
        .arg(&target_dir)
        .status()
        .unwrap();
    assert!(status.success(), "building hello_native failed");
    target_dir
        .join("debug")
        .join(format!("{DLL_PREFIX}kiln_plugin_hello_native{DLL_SUFFIX}"))
}

fn context(out: &Path, shot: &str) -> Context {
    Context::new(json!({"out": out.to_string_lossy(), "shot": shot}))
}

#[test]
fn test_native_plugin_lifecycle() {
    let library = build_hello_native();
    let dir = tempdir().unwrap();
    let shared = dir.path().join("shared");
    fs::create_dir_all(&shared).unwrap();
    fs::copy(&library, shared.join(library.file_name().unwrap())).unwrap();
    let out = dir.path().join("out.txt");

    let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
    let dyn_engine: Rc<dyn Engine> = engine.clone();
    let roots = vec![dir.path().to_string_lossy().replace('\\', "/")];
    let mut manager = PluginManager::with_search_path(
        dyn_engine,
        context(&out, "010"),
        Config::default(),
        SearchPath::from(roots),
    );

    assert_eq!(manager.load_all(), 1);
    assert!(manager.failures().is_empty(), "{:?}", manager.failures());
    assert!(manager.units()[0].is_native());
    assert_eq!(manager.units()[0].name(), "Hello Native");
    assert_eq!(manager.command_names(), vec!["Hello Native".to_string()]);

    manager.run_command("Hello Native").unwrap();
    engine.trigger("Hello Native").unwrap();
    manager.switch_context(context(&out, "020"));
    assert!(manager.failures().is_empty(), "{:?}", manager.failures());

    manager.unload_all();
    assert!(manager.units().is_empty());
    assert!(engine.trigger("Hello Native").is_err());
    drop(manager);

    assert_eq!(
        fs::read_to_string(&out).unwrap(),
        "register on tk-shell\n\
         execute 010\n\
         execute 010\n\
         plugin changed 010 -> 020\n\
         changed 010 -> 020\n\
         unregister\n\
         dropped\n"
    );
}
