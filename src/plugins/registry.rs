//! Live command instances.
//!
//! Every command or panel that passed registration is kept here until the
//! plugin subsystem is torn down.
//!
//! Instance identity (name, serial, source) is immutable and readable
//! without borrowing. Plugin behaviour sits behind its own `RefCell`, and it
//! is only borrowed for the duration of one call into plugin code. Plugins
//! may therefore register further commands from inside any hook.

use anyhow::{anyhow, bail, Result};
use std::cell::{Cell, RefCell, RefMut};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::host::{Context, PanelId, WidgetDescriptor, WidgetId};
use crate::plugins::api::{Command, CommandKind, HostBindings, Panel, Properties};
use crate::plugins::identity::Owner;

/// The plugin-provided behaviour behind an instance
pub enum Behavior {
    Command(Box<dyn Command>),
    Panel(Box<dyn Panel>),
}

impl Behavior {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Command(_) => CommandKind::Command,
            Self::Panel(_) => CommandKind::Panel,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Command(c) => c.name(),
            Self::Panel(p) => p.name(),
        }
    }

    #[must_use]
    pub fn properties(&self) -> Properties {
        match self {
            Self::Command(c) => c.properties(),
            Self::Panel(p) => p.properties(),
        }
    }

    #[must_use]
    pub fn available(&self, host: &HostBindings) -> bool {
        match self {
            Self::Command(c) => c.available(host),
            Self::Panel(p) => p.available(host),
        }
    }

    pub fn init(&mut self, host: &HostBindings) -> Result<()> {
        match self {
            Self::Command(c) => c.init(host),
            Self::Panel(p) => p.init(host),
        }
    }

    pub fn context_changed(&mut self, host: &HostBindings, old: &Context, new: &Context) -> Result<()> {
        match self {
            Self::Command(c) => c.context_changed(host, old, new),
            Self::Panel(p) => p.context_changed(host, old, new),
        }
    }
}

/// One registered command or panel
pub struct CommandInstance {
    serial: u64,
    name: String,
    kind: CommandKind,
    properties: Properties,
    source: Option<PathBuf>,
    owner: RefCell<Owner>,
    bindings: RefCell<HostBindings>,
    behavior: RefCell<Behavior>,
    panel_id: RefCell<Option<PanelId>>,
    widget: Cell<Option<WidgetId>>,
}

impl CommandInstance {
    pub(crate) fn new(
        serial: u64,
        behavior: Behavior,
        properties: Properties,
        bindings: HostBindings,
        owner: Owner,
        source: Option<PathBuf>,
    ) -> Self {
        Self {
            serial,
            name: behavior.name().to_string(),
            kind: behavior.kind(),
            properties,
            source,
            owner: RefCell::new(owner),
            bindings: RefCell::new(bindings),
            behavior: RefCell::new(behavior),
            panel_id: RefCell::new(None),
            widget: Cell::new(None),
        }
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Properties as submitted to the host, icon already resolved
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub fn bindings(&self) -> HostBindings {
        self.bindings.borrow().clone()
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.bindings.borrow().context.clone()
    }

    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner.borrow().clone()
    }

    /// Plugin file whose `register()` created this instance
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn panel_id(&self) -> Option<PanelId> {
        self.panel_id.borrow().clone()
    }

    /// The currently shown widget, if any
    #[must_use]
    pub fn widget(&self) -> Option<WidgetId> {
        self.widget.get()
    }

    pub(crate) fn set_owner(&self, owner: Owner) {
        self.owner.replace(owner);
    }

    pub(crate) fn set_panel_id(&self, panel_id: PanelId) {
        self.panel_id.replace(Some(panel_id));
    }

    pub(crate) fn set_widget(&self, widget: Option<WidgetId>) {
        self.widget.set(widget);
    }

    fn behavior_mut(&self) -> Result<RefMut<'_, Behavior>> {
        self.behavior
            .try_borrow_mut()
            .map_err(|_| anyhow!("'{}' is already running", self.name))
    }

    pub(crate) fn execute_command(&self) -> Result<()> {
        let bindings = self.bindings();
        let mut behavior = self.behavior_mut()?;
        match &mut *behavior {
            Behavior::Command(command) => command.execute(&bindings),
            Behavior::Panel(_) => bail!("'{}' is a panel", self.name),
        }
    }

    pub(crate) fn describe_panel(&self) -> Result<WidgetDescriptor> {
        let bindings = self.bindings();
        let mut behavior = self.behavior_mut()?;
        match &mut *behavior {
            Behavior::Panel(panel) => panel.execute(&bindings),
            Behavior::Command(_) => bail!("'{}' is not a panel", self.name),
        }
    }

    /// Clear the current widget if it is `closed`, then run `on_close`.
    pub(crate) fn widget_closed(&self, closed: WidgetId) -> Result<()> {
        if self.widget.get() == Some(closed) {
            self.widget.set(None);
        }
        let bindings = self.bindings();
        let mut behavior = self.behavior_mut()?;
        match &mut *behavior {
            Behavior::Panel(panel) => panel.on_close(&bindings, closed),
            Behavior::Command(_) => Ok(()),
        }
    }

    pub(crate) fn rebind(&self, bindings: HostBindings, old: &Context, new: &Context) -> Result<()> {
        self.bindings.replace(bindings.clone());
        let mut behavior = self.behavior_mut()?;
        behavior.context_changed(&bindings, old, new)
    }
}

impl std::fmt::Debug for CommandInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInstance")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("source", &self.source)
            .field("widget", &self.widget)
            .finish_non_exhaustive()
    }
}

pub type SharedInstance = Rc<CommandInstance>;

/// An instance evicted by a later registration of the same name
struct Replacement {
    by: u64,
    previous: SharedInstance,
}

/// Result of [`CommandRegistry::rollback`]
#[derive(Debug, Default)]
pub struct Rollback {
    /// Instances removed from the registry
    pub dropped: usize,
    /// Earlier instances put back because their replacement was rolled back
    pub restored: Vec<SharedInstance>,
}

/// Ordered set of live instances keyed by name
#[derive(Default)]
pub struct CommandRegistry {
    instances: Vec<SharedInstance>,
    replaced: Vec<Replacement>,
    next_serial: u64,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial number the next inserted instance will receive
    #[must_use]
    pub fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Serial at which a rollback should start
    #[must_use]
    pub fn mark(&self) -> u64 {
        self.next_serial
    }

    /// Add an instance, replacing any live instance of the same name.
    ///
    /// The replaced instance is remembered until [`Self::commit`] so a
    /// rollback can bring it back.
    pub fn insert(&mut self, instance: SharedInstance) -> Option<SharedInstance> {
        let replaced = self
            .instances
            .iter()
            .position(|i| i.name() == instance.name())
            .map(|index| self.instances.remove(index));
        if let Some(previous) = &replaced {
            self.replaced.push(Replacement {
                by: instance.serial(),
                previous: previous.clone(),
            });
        }
        self.instances.push(instance);
        replaced
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.instances.iter().any(|i| i.name() == name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedInstance> {
        self.instances.iter().find(|i| i.name() == name).cloned()
    }

    /// Drop every instance registered at or after `mark` and restore the
    /// instances they replaced.
    pub fn rollback(&mut self, mark: u64) -> Rollback {
        let before = self.instances.len();
        self.instances.retain(|i| i.serial() < mark);
        let mut rollback = Rollback {
            dropped: before - self.instances.len(),
            restored: Vec::new(),
        };

        while self.replaced.last().is_some_and(|r| r.by >= mark) {
            let Some(replacement) = self.replaced.pop() else {
                break;
            };
            let previous = replacement.previous;
            if previous.serial() < mark && !self.contains(previous.name()) {
                self.instances.push(previous.clone());
                rollback.restored.push(previous);
            }
        }
        rollback
    }

    /// Forget replaced instances; registrations so far are final.
    pub fn commit(&mut self) {
        self.replaced.clear();
    }

    #[must_use]
    pub fn instances(&self) -> &[SharedInstance] {
        &self.instances
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn clear(&mut self) {
        self.replaced.clear();
        self.instances.clear();
    }
}
