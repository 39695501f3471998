use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use libloading::{Library, Symbol};
use mlua::Lua;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{PluginError, PluginResult};
use crate::host::Context;
use crate::plugins::host::{HostApi, PluginHost};
use crate::plugins::lua;

/// Entry points a native plugin library implements
///
/// The library must be built with the same compiler and the same `kiln`
/// version as the runtime loading it. Every command it registers is dropped
/// before the library is unmapped.
pub trait NativePlugin {
    /// Get plugin name
    fn name(&self) -> &str;

    /// Register commands and panels through `host`
    fn register(&mut self, host: &dyn HostApi) -> Result<()>;

    /// Undo anything `register` set up outside the host registry
    fn unregister(&mut self, _host: &dyn HostApi) -> Result<()> {
        Ok(())
    }

    /// Called after the host switched context
    fn context_changed(&mut self, _host: &dyn HostApi, _old: &Context, _new: &Context) -> Result<()> {
        Ok(())
    }
}

/// Function signature for plugin entry point
pub type PluginCreate = unsafe fn() -> *mut dyn NativePlugin;

/// Symbol every native plugin library exports
pub const CREATE_SYMBOL: &[u8] = b"_kiln_plugin_create";

/// A loaded shared library and the plugin object it created
pub struct NativeLibrary {
    #[allow(dead_code)]
    library: Library,
    /// Raw pointer to the plugin - must be properly dropped
    plugin_ptr: *mut dyn NativePlugin,
}

impl NativeLibrary {
    fn plugin_ref(&self) -> &dyn NativePlugin {
        // Safety: see `plugin`.
        unsafe { &*self.plugin_ptr }
    }

    fn plugin(&mut self) -> &mut dyn NativePlugin {
        // Safety: the pointer was checked for null at load time and is only
        // released in `drop`, while `library` is still mapped.
        unsafe { &mut *self.plugin_ptr }
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        // Safety: The plugin was created by the plugin's constructor
        // and we are responsible for cleaning it up
        if !self.plugin_ptr.is_null() {
            unsafe {
                drop(Box::from_raw(self.plugin_ptr));
            }
        }
    }
}

enum Backend {
    Script(Rc<Lua>),
    Native(NativeLibrary),
}

/// One successfully loaded plugin file
pub struct PluginUnit {
    path: PathBuf,
    backend: Backend,
    loaded_at: DateTime<Utc>,
}

impl PluginUnit {
    /// Execute a script in a fresh Lua state seeded with the host module
    ///
    /// # Errors
    /// Returns [`PluginError::Load`] if the file cannot be read or its
    /// top-level code fails.
    pub fn load_script(path: &Path, host: &Rc<PluginHost>) -> PluginResult<Self> {
        let load_error = |message: String| PluginError::Load {
            path: path.to_path_buf(),
            message,
        };

        let source = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;

        let state = Rc::new(Lua::new());
        lua::install_host_module(&state, host, path).map_err(|e| load_error(e.to_string()))?;

        state
            .load(source.as_str())
            .set_name(format!("@{}", path.display()))
            .exec()
            .map_err(|e| load_error(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            backend: Backend::Script(state),
            loaded_at: Utc::now(),
        })
    }

    /// Load a plugin from a dynamic library
    ///
    /// # Errors
    /// Returns [`PluginError::Load`] if the library cannot be opened, lacks
    /// the constructor symbol, or the constructor returns null.
    pub fn load_native(path: &Path) -> PluginResult<Self> {
        let library = Self::open_native(path).map_err(|e| PluginError::Load {
            path: path.to_path_buf(),
            message: format!("{e:#}"),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            backend: Backend::Native(library),
            loaded_at: Utc::now(),
        })
    }

    fn open_native(path: &Path) -> Result<NativeLibrary> {
        unsafe {
            let library = Library::new(path).context("Failed to load plugin library")?;

            let constructor: Symbol<PluginCreate> = library
                .get(CREATE_SYMBOL)
                .context("Failed to find plugin constructor")?;

            let plugin_ptr = constructor();

            // Validate the pointer before using it
            if plugin_ptr.is_null() {
                anyhow::bail!("Plugin constructor returned null pointer");
            }

            Ok(NativeLibrary {
                library,
                plugin_ptr,
            })
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The native plugin's own name, or the script's file stem
    #[must_use]
    pub fn name(&self) -> String {
        match &self.backend {
            Backend::Native(library) => library.plugin_ref().name().to_string(),
            Backend::Script(_) => self
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.backend, Backend::Native(_))
    }

    /// Whether the unit defines a `register` entry point
    #[must_use]
    pub fn has_register(&self) -> bool {
        self.has_entry_point("register")
    }

    /// Whether the unit defines an `unregister` entry point
    #[must_use]
    pub fn has_unregister(&self) -> bool {
        self.has_entry_point("unregister")
    }

    fn has_entry_point(&self, name: &str) -> bool {
        match &self.backend {
            Backend::Script(state) => matches!(lua::global_function(state, name), Ok(Some(_))),
            Backend::Native(_) => true,
        }
    }

    /// Names defined in the unit's namespace, sorted
    #[must_use]
    pub fn namespace(&self) -> Vec<String> {
        let Backend::Script(state) = &self.backend else {
            return Vec::new();
        };
        let mut names: Vec<String> = state
            .globals()
            .pairs::<mlua::Value, mlua::Value>()
            .filter_map(|pair| match pair {
                Ok((mlua::Value::String(key), _)) => key.to_str().ok().map(str::to_string),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Invoke `register()`. Returns `false` when the unit defines none.
    ///
    /// # Errors
    /// Returns whatever the entry point raised.
    pub fn register(&mut self, host: &PluginHost) -> Result<bool> {
        match &mut self.backend {
            Backend::Script(state) => call_entry_point(state, "register"),
            Backend::Native(library) => library.plugin().register(host).map(|()| true),
        }
    }

    /// Invoke `unregister()`. Returns `false` when the unit defines none.
    ///
    /// # Errors
    /// Returns whatever the entry point raised.
    pub fn unregister(&mut self, host: &PluginHost) -> Result<bool> {
        match &mut self.backend {
            Backend::Script(state) => call_entry_point(state, "unregister"),
            Backend::Native(library) => library.plugin().unregister(host).map(|()| true),
        }
    }

    /// Refresh the unit's host bindings, then run its `context_changed` hook
    ///
    /// # Errors
    /// Returns whatever the hook raised.
    pub fn context_changed(&mut self, host: &PluginHost, old: &Context, new: &Context) -> Result<()> {
        match &mut self.backend {
            Backend::Script(state) => {
                lua::refresh_bindings(state, &host.bindings())?;
                if let Some(hook) = lua::global_function(state, "context_changed")? {
                    let old = lua::to_lua(state, old.value())?;
                    let new = lua::to_lua(state, new.value())?;
                    hook.call::<_, ()>((old, new))?;
                }
                Ok(())
            }
            Backend::Native(library) => library.plugin().context_changed(host, old, new),
        }
    }

    /// Drop the host module from the unit's module table
    pub(crate) fn detach(&mut self) -> Result<()> {
        if let Backend::Script(state) = &self.backend {
            lua::remove_host_module(state)?;
        }
        Ok(())
    }
}

fn call_entry_point(state: &Lua, name: &str) -> Result<bool> {
    match lua::global_function(state, name)? {
        Some(entry) => {
            entry.call::<_, ()>(())?;
            Ok(true)
        }
        None => Ok(false),
    }
}

impl std::fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginUnit")
            .field("path", &self.path)
            .field("native", &self.is_native())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::{Engine, LocalEngine};
    use crate::paths::SearchPath;
    use crate::plugins::identity::App;
    use tempfile::tempdir;

    fn host() -> Rc<PluginHost> {
        let engine: Rc<dyn Engine> = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let app = Rc::new(App::new("Commands", SearchPath::default()));
        PluginHost::new(app, engine, Context::default(), Config::default())
    }

    #[test]
    fn test_script_namespace_and_entry_points() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tools.lua");
        std::fs::write(&path, "local kiln = require('kiln')\nfunction register() end\nanswer = 42\n").unwrap();

        let host = host();
        let mut unit = PluginUnit::load_script(&path, &host).unwrap();
        assert_eq!(unit.name(), "tools");
        assert!(unit.has_register());
        assert!(!unit.has_unregister());
        assert!(unit.namespace().contains(&"answer".to_string()));
        assert!(unit.register(&host).unwrap());
        assert!(!unit.unregister(&host).unwrap());
    }

    #[test]
    fn test_each_script_gets_its_own_namespace() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.lua");
        let second = dir.path().join("second.lua");
        std::fs::write(&first, "shared_name = 'first'").unwrap();
        std::fs::write(&second, "assert(shared_name == nil)").unwrap();

        let host = host();
        PluginUnit::load_script(&first, &host).unwrap();
        assert!(PluginUnit::load_script(&second, &host).is_ok());
    }

    #[test]
    fn test_script_error_is_load_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.lua");
        std::fs::write(&path, "require('does_not_exist')").unwrap();

        let err = PluginUnit::load_script(&path, &host()).unwrap_err();
        assert!(matches!(err, PluginError::Load { ref path, .. } if path.ends_with("broken.lua")));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let err = PluginUnit::load_script(Path::new("/no/such/plugin.lua"), &host()).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
    }

    #[test]
    fn test_invalid_native_library() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("fake.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&path, b"not a library").unwrap();

        let err = PluginUnit::load_native(&path).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
    }

    #[test]
    fn test_detach_removes_host_module() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detached.lua");
        std::fs::write(&path, "function has_kiln() return package.loaded.kiln ~= nil end").unwrap();

        let host = host();
        let mut unit = PluginUnit::load_script(&path, &host).unwrap();
        unit.detach().unwrap();

        let Backend::Script(state) = &unit.backend else {
            panic!("expected a script unit");
        };
        let has_kiln = lua::global_function(state, "has_kiln").unwrap().unwrap();
        assert!(!has_kiln.call::<_, bool>(()).unwrap());
    }
}
