//! Handle through which plugins reach the host.
//!
//! A [`PluginHost`] is passed explicitly to every plugin entry point. It
//! carries the app, engine and context bindings, runs the registration
//! protocol for commands and panels, and owns the live command registry.

use std::cell::{Ref, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

use crate::config::{Config, DuplicatePolicy};
use crate::error::{PluginError, PluginResult};
use crate::host::{CommandCallback, CommandRegistration, Context, Engine, WidgetId};
use crate::plugins::api::{Command, CommandKind, HostBindings, Panel};
use crate::plugins::identity::{display_group, App};
use crate::plugins::registry::{Behavior, CommandInstance, CommandRegistry, SharedInstance};

/// Outcome of a registration attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Handed to the host and recorded in the live registry
    Registered,
    /// `available()` returned false; nothing was registered
    Rejected,
}

/// Host operations reachable from native plugin libraries.
///
/// Native plugins call back into the runtime only through this trait, so
/// every closure and bookkeeping value they cause to be created is built by
/// code that stays mapped after the library is unloaded.
pub trait HostApi {
    /// Register a command with the host
    fn register_command(&self, command: Box<dyn Command>) -> PluginResult<Registration>;

    /// Register a panel with the host
    fn register_panel(&self, panel: Box<dyn Panel>) -> PluginResult<Registration>;

    /// The current context
    fn context(&self) -> Context;

    /// Resolve a path relative to the plugin search roots
    fn get_resource(&self, relative: &str) -> Option<PathBuf>;

    /// Name of the running engine instance
    fn engine_name(&self) -> String;
}

pub struct PluginHost {
    app: Rc<App>,
    engine: Rc<dyn Engine>,
    context: RefCell<Context>,
    config: Config,
    registry: RefCell<CommandRegistry>,
    current_source: RefCell<Option<PathBuf>>,
    this: Weak<PluginHost>,
}

impl PluginHost {
    #[must_use]
    pub fn new(app: Rc<App>, engine: Rc<dyn Engine>, context: Context, config: Config) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            app,
            engine,
            context: RefCell::new(context),
            config,
            registry: RefCell::new(CommandRegistry::new()),
            current_source: RefCell::new(None),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn app(&self) -> &Rc<App> {
        &self.app
    }

    #[must_use]
    pub fn engine(&self) -> &Rc<dyn Engine> {
        &self.engine
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.context.borrow().clone()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn set_context(&self, context: Context) {
        self.context.replace(context);
    }

    /// Fresh bindings reflecting the current app, engine and context
    #[must_use]
    pub fn bindings(&self) -> HostBindings {
        HostBindings::new(&self.app, &self.engine, self.context())
    }

    #[must_use]
    pub fn registry(&self) -> Ref<'_, CommandRegistry> {
        self.registry.borrow()
    }

    /// Resolve a path relative to the plugin search roots
    #[must_use]
    pub fn get_resource(&self, relative: &str) -> Option<PathBuf> {
        self.app.get_resource(relative)
    }

    /// Attribute registrations to `source` until the returned guard drops
    pub(crate) fn scoped_source(&self, source: &Path) -> SourceScope<'_> {
        let previous = self.current_source.replace(Some(source.to_path_buf()));
        SourceScope { host: self, previous }
    }

    pub(crate) fn registry_mark(&self) -> u64 {
        self.registry.borrow().mark()
    }

    /// Undo every registration made since `mark`.
    ///
    /// Instances that were replaced by a rolled back registration go back
    /// into the live registry and are handed to the engine again.
    pub(crate) fn rollback(&self, mark: u64) -> usize {
        let rollback = self.registry.borrow_mut().rollback(mark);
        for instance in rollback.restored {
            match self.attach(&instance, instance.owner().display_group) {
                Ok(()) => debug!(command = %instance.name(), "Restored replaced command"),
                Err(e) => warn!(command = %instance.name(), error = %e, "Failed to restore replaced command"),
            }
        }
        rollback.dropped
    }

    pub(crate) fn commit(&self) {
        self.registry.borrow_mut().commit();
    }

    pub(crate) fn clear_registry(&self) {
        self.registry.borrow_mut().clear();
    }

    /// Register a command with the host
    ///
    /// # Errors
    /// Returns an error if the command has no name, if `init` fails, if a
    /// duplicate is rejected by policy, or if the engine refuses it.
    pub fn register_command(&self, command: Box<dyn Command>) -> PluginResult<Registration> {
        self.register_behavior(Behavior::Command(command))
    }

    /// Register a panel with the host
    ///
    /// # Errors
    /// As [`Self::register_command`], and additionally when the engine
    /// cannot host panels.
    pub fn register_panel(&self, panel: Box<dyn Panel>) -> PluginResult<Registration> {
        self.register_behavior(Behavior::Panel(panel))
    }

    fn register_behavior(&self, mut behavior: Behavior) -> PluginResult<Registration> {
        let kind = behavior.kind();
        let name = behavior.name().to_string();
        if name.trim().is_empty() {
            return Err(PluginError::contract(kind, "name must be a non-empty string"));
        }

        let bindings = self.bindings();
        if !behavior.available(&bindings) {
            debug!(command = %name, "Command not available in this context");
            return Ok(Registration::Rejected);
        }

        if kind == CommandKind::Panel && !self.engine.supports_panels() {
            return Err(PluginError::PanelsUnsupported(
                self.engine.instance_name().to_string(),
            ));
        }

        if self.config.duplicate_policy == DuplicatePolicy::Reject
            && self.registry.borrow().contains(&name)
        {
            return Err(PluginError::DuplicateCommand(name));
        }

        let mut properties = behavior.properties();
        properties.resolve_icon(self.app.search_path());

        behavior
            .init(&bindings)
            .map_err(|e| PluginError::Execution {
                name: name.clone(),
                message: format!("{e:#}"),
            })?;

        let group = display_group(&properties, kind, &self.config.display_groups, &self.app);
        let serial = self.registry.borrow_mut().next_serial();
        let source = self.current_source.borrow().clone();
        let instance = Rc::new(CommandInstance::new(
            serial,
            behavior,
            properties,
            bindings,
            self.app.owner(),
            source,
        ));

        self.attach(&instance, group)?;

        let previous = self.registry.borrow_mut().insert(instance);
        if let Some(previous) = previous {
            warn!(
                command = %name,
                previous = ?previous.source(),
                "Command name registered twice, keeping the latest"
            );
        }
        info!(command = %name, kind = kind.as_str(), "Registered command");

        Ok(Registration::Registered)
    }

    /// Hand an instance to the engine under `group`
    fn attach(&self, instance: &SharedInstance, group: String) -> PluginResult<()> {
        let callback = self.callback_for(instance);
        let _scope = self.app.scoped_display_group(group);
        let owner = self.app.owner();

        if instance.kind() == CommandKind::Panel {
            let panel_id = self
                .engine
                .register_panel(instance.name(), callback.clone())
                .map_err(|e| PluginError::Host(format!("{e:#}")))?;
            instance.set_panel_id(panel_id);
        }

        self.engine
            .register_command(CommandRegistration {
                name: instance.name().to_string(),
                callback,
                properties: instance.properties().clone(),
                owner: owner.clone(),
            })
            .map_err(|e| PluginError::Host(format!("{e:#}")))?;

        instance.set_owner(owner);
        Ok(())
    }

    fn callback_for(&self, instance: &SharedInstance) -> CommandCallback {
        let host = self.this.clone();
        let instance = Rc::downgrade(instance);
        Rc::new(move || {
            let host = host
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("plugin subsystem has been unloaded"))?;
            let instance = instance
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("command has been unregistered"))?;
            host.invoke(&instance)?;
            Ok(())
        })
    }

    /// Run a command, or show a panel, by name
    ///
    /// # Errors
    /// Returns an error for unknown names or when the command itself fails.
    pub fn run(&self, name: &str) -> PluginResult<Option<WidgetId>> {
        let instance = self.live(name)?;
        self.invoke(&instance)
    }

    /// Show a live panel by name
    ///
    /// # Errors
    /// Returns an error for unknown names, plain commands, or when the
    /// panel or the engine fails.
    pub fn show(&self, name: &str) -> PluginResult<WidgetId> {
        let instance = self.live(name)?;
        if instance.kind() != CommandKind::Panel {
            return Err(PluginError::NotAPanel(name.to_string()));
        }
        self.show_panel(&instance)
    }

    fn live(&self, name: &str) -> PluginResult<SharedInstance> {
        self.registry
            .borrow()
            .get(name)
            .ok_or_else(|| PluginError::UnknownCommand(name.to_string()))
    }

    fn invoke(&self, instance: &SharedInstance) -> PluginResult<Option<WidgetId>> {
        match instance.kind() {
            CommandKind::Command => {
                instance
                    .execute_command()
                    .map_err(|e| PluginError::Execution {
                        name: instance.name().to_string(),
                        message: format!("{e:#}"),
                    })?;
                Ok(None)
            }
            CommandKind::Panel => self.show_panel(instance).map(Some),
        }
    }

    fn show_panel(&self, instance: &SharedInstance) -> PluginResult<WidgetId> {
        let descriptor = instance
            .describe_panel()
            .map_err(|e| PluginError::Execution {
                name: instance.name().to_string(),
                message: format!("{e:#}"),
            })?;
        let panel_id = instance
            .panel_id()
            .ok_or_else(|| PluginError::Host(format!("panel '{}' has no id", instance.name())))?;

        let widget = self
            .engine
            .show_panel(&panel_id, instance.name(), &instance.owner(), descriptor)
            .map_err(|e| PluginError::Host(format!("{e:#}")))?;
        instance.set_widget(Some(widget));

        let weak = Rc::downgrade(instance);
        self.engine
            .subscribe_close(
                widget,
                Box::new(move |closed| {
                    let Some(instance) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = instance.widget_closed(closed) {
                        warn!(panel = %instance.name(), widget = %closed, error = %e, "Panel on_close failed");
                    }
                }),
            )
            .map_err(|e| PluginError::Host(format!("{e:#}")))?;

        debug!(panel = %instance.name(), widget = %widget, "Panel shown");
        Ok(widget)
    }

    /// Rebind every live instance to `new` and run its `context_changed`.
    ///
    /// Returns the names and errors of instances whose hook failed; those
    /// failures do not stop the pass. Commands registered by a hook are
    /// already bound to `new` and are not visited.
    pub(crate) fn propagate_context(&self, old: &Context, new: &Context) -> Vec<(String, PluginError)> {
        self.set_context(new.clone());
        let bindings = self.bindings();
        let instances: Vec<SharedInstance> = self.registry.borrow().instances().to_vec();

        let mut failures = Vec::new();
        for instance in instances {
            if let Err(e) = instance.rebind(bindings.clone(), old, new) {
                let name = instance.name().to_string();
                failures.push((
                    name.clone(),
                    PluginError::Execution {
                        name,
                        message: format!("{e:#}"),
                    },
                ));
            }
        }
        failures
    }
}

impl HostApi for PluginHost {
    fn register_command(&self, command: Box<dyn Command>) -> PluginResult<Registration> {
        PluginHost::register_command(self, command)
    }

    fn register_panel(&self, panel: Box<dyn Panel>) -> PluginResult<Registration> {
        PluginHost::register_panel(self, panel)
    }

    fn context(&self) -> Context {
        PluginHost::context(self)
    }

    fn get_resource(&self, relative: &str) -> Option<PathBuf> {
        PluginHost::get_resource(self, relative)
    }

    fn engine_name(&self) -> String {
        self.engine.instance_name().to_string()
    }
}

/// Guard returned by [`PluginHost::scoped_source`]
pub(crate) struct SourceScope<'a> {
    host: &'a PluginHost,
    previous: Option<PathBuf>,
}

impl Drop for SourceScope<'_> {
    fn drop(&mut self) {
        self.host.current_source.replace(self.previous.take());
    }
}
