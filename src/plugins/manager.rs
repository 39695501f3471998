//! Plugin lifecycle: discover, load, register, propagate, unload.
//!
//! Loading is a plain sequential pass over search roots, then directories,
//! then files. Every plugin file is fully executed, including its
//! `register()`, before the next one starts. Errors are contained per file
//! and recorded in the failure ledger; none of them abort a pass.
//!
//! The runtime is single threaded (`Rc`/`RefCell` throughout). Loading in
//! parallel would need one registry lock and one host module per load.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{PluginError, PluginResult};
use crate::host::{Context, Engine, WidgetId};
use crate::paths::SearchPath;
use crate::plugins::host::PluginHost;
use crate::plugins::identity::{reattach_commands, App};
use crate::plugins::loader::PluginUnit;

/// Where in the lifecycle a contained failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Load,
    Register,
    Unregister,
    ContextChange,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Load => "load",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::ContextChange => "context change",
        };
        f.write_str(stage)
    }
}

/// A logged, contained plugin failure
#[derive(Debug, Clone)]
pub struct PluginFailure {
    pub path: PathBuf,
    pub stage: FailureStage,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Owns every loaded plugin unit and the host handle they register through
pub struct PluginManager {
    host: Rc<PluginHost>,
    units: Vec<PluginUnit>,
    failures: Vec<PluginFailure>,
}

impl PluginManager {
    /// Create a manager whose search path comes from the configured
    /// environment variable and the engine's pipeline configuration.
    #[must_use]
    pub fn new(engine: Rc<dyn Engine>, context: Context, config: Config) -> Self {
        let search_path = SearchPath::from_env(
            &config.commands_path_env,
            &engine.config_location(),
            &config.commands_dir,
        );
        Self::with_search_path(engine, context, config, search_path)
    }

    #[must_use]
    pub fn with_search_path(
        engine: Rc<dyn Engine>,
        context: Context,
        config: Config,
        search_path: SearchPath,
    ) -> Self {
        let app = Rc::new(App::new(config.display_groups.app.clone(), search_path));
        Self {
            host: PluginHost::new(app, engine, context, config),
            units: Vec::new(),
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn host(&self) -> &Rc<PluginHost> {
        &self.host
    }

    #[must_use]
    pub fn search_path(&self) -> &SearchPath {
        self.host.app().search_path()
    }

    #[must_use]
    pub fn units(&self) -> &[PluginUnit] {
        &self.units
    }

    #[must_use]
    pub fn failures(&self) -> &[PluginFailure] {
        &self.failures
    }

    /// Names of the live commands and panels, in registration order
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.host.registry().names()
    }

    /// Load every plugin found under the search path
    ///
    /// Returns how many units were loaded by this pass.
    pub fn load_all(&mut self) -> usize {
        let engine_name = self.host.engine().instance_name().to_string();
        let shared = self.host.config().shared_dir.clone();
        let before = self.units.len();

        for dir in self.search_path().candidate_dirs(&engine_name, &shared) {
            if !dir.is_dir() {
                continue;
            }
            debug!(path = %dir.display(), "Loading commands");
            self.load_dir(&dir);
        }

        let loaded = self.units.len() - before;
        info!(
            loaded,
            commands = self.host.registry().len(),
            failures = self.failures.len(),
            "Plugin load pass finished"
        );
        loaded
    }

    /// Load the plugin files directly inside `dir`, in file name order
    pub fn load_dir(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to read commands directory");
                return;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for file in files {
            let config = self.host.config();
            if config.is_script(&file) || config.is_native_library(&file) {
                self.load_file(&file);
            }
        }
    }

    /// Load one plugin file and invoke its `register()`
    ///
    /// Returns `true` if the file itself loaded, even when `register()` failed.
    pub fn load_file(&mut self, path: &Path) -> bool {
        let mark = self.host.registry_mark();
        let loaded = {
            let _source = self.host.scoped_source(path);
            if self.host.config().is_native_library(path) {
                PluginUnit::load_native(path)
            } else {
                PluginUnit::load_script(path, &self.host)
            }
        };

        let mut unit = match loaded {
            Ok(unit) => unit,
            Err(e) => {
                // Commands created by top-level code die with the file.
                self.host.rollback(mark);
                error!(path = %path.display(), error = %e, "Failed to load command module");
                self.record(path, FailureStage::Load, &e);
                return false;
            }
        };

        let registered = {
            let _source = self.host.scoped_source(path);
            unit.register(&self.host)
        };
        match registered {
            Ok(_) => {
                self.host.commit();
                debug!(path = %path.display(), plugin = %unit.name(), "Loaded command module");
            }
            Err(e) => {
                let dropped = self.host.rollback(mark);
                let err = PluginError::Registration {
                    path: path.to_path_buf(),
                    message: format!("{e:#}"),
                };
                error!(path = %path.display(), error = %err, dropped, "Failed to register command module");
                self.record(path, FailureStage::Register, &err);
            }
        }

        self.units.push(unit);
        true
    }

    /// Invoke every unit's `unregister()`, then discard commands and units
    ///
    /// Commands are dropped before their units so that no instance outlives
    /// the library or Lua state that implements it. Safe to call repeatedly
    /// and with nothing loaded.
    pub fn unload_all(&mut self) {
        let mut units = std::mem::take(&mut self.units);
        for unit in &mut units {
            match unit.unregister(&self.host) {
                Ok(_) => debug!(path = %unit.path().display(), plugin = %unit.name(), "Unloaded command module"),
                Err(e) => {
                    let err = PluginError::Unregistration {
                        path: unit.path().to_path_buf(),
                        message: format!("{e:#}"),
                    };
                    error!(path = %unit.path().display(), error = %err, "Failed to unload command module");
                    self.record(unit.path(), FailureStage::Unregister, &err);
                }
            }
            if let Err(e) = unit.detach() {
                warn!(path = %unit.path().display(), error = %e, "Failed to detach host module");
            }
        }
        self.host.clear_registry();
        drop(units);
    }

    /// Rebind every unit and live command to `new`, then run their
    /// `context_changed(old, new)` hooks. Completes before returning.
    ///
    /// Returns how many host commands were re-attached afterwards.
    pub fn propagate_context_change(&mut self, old: &Context, new: &Context) -> usize {
        let mut failures = Vec::new();

        self.host.set_context(new.clone());
        for unit in &mut self.units {
            if let Err(e) = unit.context_changed(&self.host, old, new) {
                failures.push((unit.path().to_path_buf(), format!("{e:#}")));
            }
        }

        for (name, err) in self.host.propagate_context(old, new) {
            let path = self
                .host
                .registry()
                .get(&name)
                .and_then(|instance| instance.source().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(&name));
            failures.push((path, err.to_string()));
        }

        for (path, message) in failures {
            warn!(path = %path.display(), error = %message, "context_changed failed");
            self.failures.push(PluginFailure {
                path,
                stage: FailureStage::ContextChange,
                message,
                at: Utc::now(),
            });
        }

        reattach_commands(self.host.engine().as_ref(), self.host.app())
    }

    /// Switch to `new` and propagate the change
    pub fn switch_context(&mut self, new: Context) -> usize {
        let old = self.host.context();
        self.propagate_context_change(&old, &new)
    }

    /// Run a live command, or show a live panel, by name
    ///
    /// # Errors
    /// Returns an error if no live command has this name or it fails.
    pub fn run_command(&self, name: &str) -> PluginResult<Option<WidgetId>> {
        self.host.run(name)
    }

    /// Show a live panel by name
    ///
    /// # Errors
    /// Returns an error if no live panel has this name or showing it fails.
    pub fn show_panel(&self, name: &str) -> PluginResult<WidgetId> {
        self.host.show(name)
    }

    fn record(&mut self, path: &Path, stage: FailureStage, err: &PluginError) {
        self.failures.push(PluginFailure {
            path: path.to_path_buf(),
            stage,
            message: err.to_string(),
            at: Utc::now(),
        });
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalEngine;

    fn manager() -> PluginManager {
        let engine: Rc<dyn Engine> = Rc::new(LocalEngine::new("tk-shell", "/no/such/config"));
        PluginManager::with_search_path(
            engine,
            Context::default(),
            Config::default(),
            SearchPath::from(vec!["/no/such/root".to_string()]),
        )
    }

    #[test]
    fn test_missing_roots_are_skipped() {
        let mut manager = manager();
        assert_eq!(manager.load_all(), 0);
        assert!(manager.failures().is_empty());
    }

    #[test]
    fn test_unload_empty_is_noop() {
        let mut manager = manager();
        manager.unload_all();
        manager.unload_all();
        assert!(manager.units().is_empty());
        assert!(manager.command_names().is_empty());
    }

    #[test]
    fn test_unknown_command() {
        let manager = manager();
        assert!(matches!(
            manager.run_command("Nope"),
            Err(PluginError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_failure_stage_display() {
        assert_eq!(FailureStage::ContextChange.to_string(), "context change");
    }
}
