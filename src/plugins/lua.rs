//! Lua bindings for plugin scripts.
//!
//! Each script runs in its own Lua state. Before the script executes, the
//! `kiln` module is placed in that state's `package.loaded`, so
//! `require("kiln")` hands the script its `app`, `engine` and `context`.
//! The same three values are seeded as globals.
//!
//! ```lua
//! local kiln = require("kiln")
//!
//! local SayHello = kiln.app.Command {
//!     name = "Say Hello...",
//!     properties = { icon = "icons/say_hello.png" },
//!     execute = function(self)
//!         kiln.app.log.info("HELLO " .. self.context.user.name)
//!     end,
//! }
//!
//! function register()
//!     SayHello:register()
//! end
//! ```

use anyhow::Context as _;
use mlua::{DeserializeOptions, Function, Lua, LuaSerdeExt, RegistryKey, SerializeOptions, Table, Value};
use std::path::Path;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

use crate::error::PluginError;
use crate::host::{Context, WidgetDescriptor, WidgetId};
use crate::plugins::api::{Command, CommandKind, HostBindings, Panel, Properties};
use crate::plugins::host::{PluginHost, Registration};

/// Name scripts pass to `require`
pub const MODULE_NAME: &str = "kiln";

const APP_KEY: &str = "kiln.app";
const ENGINE_KEY: &str = "kiln.engine";
const KIND_FIELD: &str = "__kind";

/// Build the `kiln` module inside `lua` and make it requireable.
pub(crate) fn install_host_module(lua: &Rc<Lua>, host: &Rc<PluginHost>, path: &Path) -> mlua::Result<()> {
    let app = lua.create_table()?;
    app.set("name", host.app().real_display_name())?;
    app.set("id", host.app().id().to_string())?;
    app.set("get_resource", resource_fn(lua, host)?)?;
    app.set("Command", define_fn(lua, host, CommandKind::Command)?)?;
    app.set("Panel", define_fn(lua, host, CommandKind::Panel)?)?;
    app.set("log", log_table(lua, path)?)?;

    let engine = lua.create_table()?;
    engine.set("instance_name", host.engine().instance_name())?;
    engine.set("supports_panels", host.engine().supports_panels())?;

    lua.set_named_registry_value(APP_KEY, app.clone())?;
    lua.set_named_registry_value(ENGINE_KEY, engine.clone())?;

    let module = lua.create_table()?;
    module.set("__name", MODULE_NAME)?;
    module.set("app", app)?;
    module.set("engine", engine)?;

    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.set(MODULE_NAME, module)?;

    refresh_bindings(lua, &host.bindings())
}

/// Point the module and the script globals at the current host bindings.
pub(crate) fn refresh_bindings(lua: &Lua, bindings: &HostBindings) -> mlua::Result<()> {
    let app: Table = lua.named_registry_value(APP_KEY)?;
    let engine: Table = lua.named_registry_value(ENGINE_KEY)?;
    let context = to_lua(lua, bindings.context.value())?;

    let globals = lua.globals();
    globals.set("app", app.clone())?;
    globals.set("engine", engine.clone())?;
    globals.set("context", context.clone())?;

    if let Some(module) = host_module(lua)? {
        module.set("app", app)?;
        module.set("engine", engine)?;
        module.set("context", context)?;
    }
    Ok(())
}

/// Remove the `kiln` module from `package.loaded`.
pub(crate) fn remove_host_module(lua: &Lua) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.set(MODULE_NAME, Value::Nil)
}

fn host_module(lua: &Lua) -> mlua::Result<Option<Table<'_>>> {
    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;
    match loaded.get::<_, Value>(MODULE_NAME)? {
        Value::Table(module) => Ok(Some(module)),
        _ => Ok(None),
    }
}

/// A global function of the script namespace, if one is defined.
pub(crate) fn global_function<'lua>(lua: &'lua Lua, name: &str) -> mlua::Result<Option<Function<'lua>>> {
    match lua.globals().get::<_, Value>(name)? {
        Value::Function(f) => Ok(Some(f)),
        _ => Ok(None),
    }
}

fn resource_fn<'lua>(lua: &'lua Lua, host: &Rc<PluginHost>) -> mlua::Result<Function<'lua>> {
    let host = Rc::downgrade(host);
    lua.create_function(move |_, relative: String| {
        Ok(host
            .upgrade()
            .and_then(|h| h.get_resource(&relative))
            .map(|p| p.to_string_lossy().into_owned()))
    })
}

fn log_table<'lua>(lua: &'lua Lua, path: &Path) -> mlua::Result<Table<'lua>> {
    let log = lua.create_table()?;
    let plugin = path.display().to_string();

    let p = plugin.clone();
    log.set("debug", lua.create_function(move |_, msg: String| {
        debug!(plugin = %p, "{msg}");
        Ok(())
    })?)?;
    let p = plugin.clone();
    log.set("info", lua.create_function(move |_, msg: String| {
        info!(plugin = %p, "{msg}");
        Ok(())
    })?)?;
    let p = plugin.clone();
    log.set("warn", lua.create_function(move |_, msg: String| {
        warn!(plugin = %p, "{msg}");
        Ok(())
    })?)?;
    log.set("error", lua.create_function(move |_, msg: String| {
        error!(plugin = %plugin, "{msg}");
        Ok(())
    })?)?;

    Ok(log)
}

fn contract(kind: CommandKind, message: &str) -> mlua::Error {
    mlua::Error::external(PluginError::contract(kind, message))
}

/// `app.Command { ... }` and `app.Panel { ... }`.
///
/// Validates the definition table and turns it into a class with a
/// `register` method.
fn define_fn<'lua>(
    lua: &'lua Rc<Lua>,
    host: &Rc<PluginHost>,
    kind: CommandKind,
) -> mlua::Result<Function<'lua>> {
    let register = register_fn(lua, host, kind)?;
    let register = lua.create_registry_value(register)?;

    lua.create_function(move |lua, class: Table| {
        let named = match class.get::<_, Value>("name")? {
            Value::String(name) => !name.to_str()?.trim().is_empty(),
            _ => false,
        };
        if !named {
            return Err(contract(kind, "name must be a non-empty string"));
        }
        if !matches!(class.get::<_, Value>("properties")?, Value::Table(_)) {
            return Err(contract(kind, "properties must be a table"));
        }
        if !matches!(class.get::<_, Value>("execute")?, Value::Function(_)) {
            return Err(contract(kind, "execute must be a function"));
        }

        let register: Function = lua.registry_value(&register)?;
        class.set("register", register)?;
        class.set(KIND_FIELD, kind.as_str())?;
        Ok(class)
    })
}

/// `Class:register()`: build an instance and run it through the host.
fn register_fn<'lua>(
    lua: &'lua Rc<Lua>,
    host: &Rc<PluginHost>,
    kind: CommandKind,
) -> mlua::Result<Function<'lua>> {
    let host: Weak<PluginHost> = Rc::downgrade(host);
    let state: Weak<Lua> = Rc::downgrade(lua);

    lua.create_function(move |lua, class: Table| {
        let host = host
            .upgrade()
            .ok_or_else(|| mlua::Error::RuntimeError("plugin subsystem has been unloaded".into()))?;

        let instance = lua.create_table()?;
        let properties: Table = class.get("properties")?;
        let copy = lua.create_table()?;
        for pair in properties.pairs::<Value, Value>() {
            let (key, value) = pair?;
            copy.set(key, value)?;
        }
        instance.set("properties", copy.clone())?;
        let meta = lua.create_table()?;
        meta.set("__index", class.clone())?;
        instance.set_metatable(Some(meta));

        let name: String = class.get("name")?;
        let properties = to_properties(lua, copy)?;
        let script = LuaScript {
            state: state.clone(),
            instance: lua.create_registry_value(instance)?,
            name,
            properties,
        };

        let outcome = match kind {
            CommandKind::Command => host.register_command(Box::new(LuaCommand(script))),
            CommandKind::Panel => host.register_panel(Box::new(LuaPanel(script))),
        }
        .map_err(mlua::Error::external)?;

        Ok(outcome == Registration::Registered)
    })
}

fn to_properties(lua: &Lua, table: Table) -> mlua::Result<Properties> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    let value: serde_json::Value = lua.from_value_with(Value::Table(table), options)?;
    Ok(Properties::from_json(value))
}

/// Convert a JSON value for plugin code. JSON `null` becomes `nil`.
pub(crate) fn to_lua<'lua>(lua: &'lua Lua, value: &serde_json::Value) -> mlua::Result<Value<'lua>> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

fn to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    lua.from_value_with(value, options)
}

/// State shared by Lua-backed commands and panels
struct LuaScript {
    state: Weak<Lua>,
    instance: RegistryKey,
    name: String,
    properties: Properties,
}

impl LuaScript {
    fn state(&self) -> anyhow::Result<Rc<Lua>> {
        self.state
            .upgrade()
            .with_context(|| format!("plugin state of '{}' has been unloaded", self.name))
    }

    /// Bind `self.app`, `self.engine` and `self.context` on the instance
    fn bind<'lua>(&self, lua: &'lua Lua, host: &HostBindings) -> mlua::Result<Table<'lua>> {
        let instance: Table = lua.registry_value(&self.instance)?;
        instance.set("app", lua.named_registry_value::<Table>(APP_KEY)?)?;
        instance.set("engine", lua.named_registry_value::<Table>(ENGINE_KEY)?)?;
        instance.set("context", to_lua(lua, host.context.value())?)?;
        Ok(instance)
    }

    fn method<'lua>(instance: &Table<'lua>, name: &str) -> mlua::Result<Option<Function<'lua>>> {
        match instance.get::<_, Value>(name)? {
            Value::Function(f) => Ok(Some(f)),
            _ => Ok(None),
        }
    }

    fn available(&self, host: &HostBindings) -> bool {
        let result = (|| -> anyhow::Result<bool> {
            let lua = self.state()?;
            let instance = self.bind(&lua, host)?;
            let available = match Self::method(&instance, "available")? {
                Some(f) => f.call::<_, bool>(instance)?,
                None => true,
            };
            Ok(available)
        })();
        result.unwrap_or_else(|e| {
            warn!(command = %self.name, error = %e, "available() failed, treating as unavailable");
            false
        })
    }

    fn call_optional(&self, host: &HostBindings, name: &str) -> anyhow::Result<()> {
        let lua = self.state()?;
        let instance = self.bind(&lua, host)?;
        if let Some(f) = Self::method(&instance, name)? {
            f.call::<_, ()>(instance)?;
        }
        Ok(())
    }

    fn context_changed(&self, host: &HostBindings, old: &Context, new: &Context) -> anyhow::Result<()> {
        let lua = self.state()?;
        let instance = self.bind(&lua, host)?;
        if let Some(f) = Self::method(&instance, "context_changed")? {
            let old = to_lua(&lua, old.value())?;
            let new = to_lua(&lua, new.value())?;
            f.call::<_, ()>((instance, old, new))?;
        }
        Ok(())
    }
}

struct LuaCommand(LuaScript);

impl Command for LuaCommand {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn properties(&self) -> Properties {
        self.0.properties.clone()
    }

    fn available(&self, host: &HostBindings) -> bool {
        self.0.available(host)
    }

    fn init(&mut self, host: &HostBindings) -> anyhow::Result<()> {
        self.0.call_optional(host, "init")
    }

    fn execute(&mut self, host: &HostBindings) -> anyhow::Result<()> {
        let lua = self.0.state()?;
        let instance = self.0.bind(&lua, host)?;
        let execute = LuaScript::method(&instance, "execute")?
            .with_context(|| format!("'{}' has no execute", self.0.name))?;
        execute.call::<_, mlua::MultiValue>(instance)?;
        Ok(())
    }

    fn context_changed(&mut self, host: &HostBindings, old: &Context, new: &Context) -> anyhow::Result<()> {
        self.0.context_changed(host, old, new)
    }
}

struct LuaPanel(LuaScript);

impl Panel for LuaPanel {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn properties(&self) -> Properties {
        self.0.properties.clone()
    }

    fn available(&self, host: &HostBindings) -> bool {
        self.0.available(host)
    }

    fn init(&mut self, host: &HostBindings) -> anyhow::Result<()> {
        self.0.call_optional(host, "init")
    }

    /// `execute` returns `kind, args, kwargs`
    fn execute(&mut self, host: &HostBindings) -> anyhow::Result<WidgetDescriptor> {
        let lua = self.0.state()?;
        let instance = self.0.bind(&lua, host)?;
        let execute = LuaScript::method(&instance, "execute")?
            .with_context(|| format!("'{}' has no execute", self.0.name))?;

        let (kind, args, kwargs) = execute.call::<_, (String, Option<Table>, Option<Table>)>(instance)?;

        let mut descriptor = WidgetDescriptor::new(kind);
        if let Some(args) = args {
            for value in args.sequence_values::<Value>() {
                descriptor.args.push(to_json(&lua, value?)?);
            }
        }
        if let Some(kwargs) = kwargs {
            for pair in kwargs.pairs::<String, Value>() {
                let (key, value) = pair?;
                descriptor.kwargs.insert(key, to_json(&lua, value)?);
            }
        }
        Ok(descriptor)
    }

    fn on_close(&mut self, host: &HostBindings, widget: WidgetId) -> anyhow::Result<()> {
        let lua = self.0.state()?;
        let instance = self.0.bind(&lua, host)?;
        if let Some(f) = LuaScript::method(&instance, "on_close")? {
            f.call::<_, ()>((instance, widget.0))?;
        }
        Ok(())
    }

    fn context_changed(&mut self, host: &HostBindings, old: &Context, new: &Context) -> anyhow::Result<()> {
        self.0.context_changed(host, old, new)
    }
}
