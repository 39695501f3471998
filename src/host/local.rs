//! In-process engine.
//!
//! Keeps commands, panels and widgets in memory. Used by the `kiln` binary
//! and by tests to drive plugins without a real application around them.

use anyhow::{bail, Context as _, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::{
    CloseListener, CommandCallback, CommandRegistration, Engine, PanelId, PooledCommand,
    WidgetDescriptor, WidgetId,
};
use crate::plugins::api::Properties;
use crate::plugins::identity::Owner;

struct PoolEntry {
    name: String,
    callback: CommandCallback,
    properties: Properties,
    owner: Owner,
}

struct ShownWidget {
    panel: PanelId,
    title: String,
    descriptor: WidgetDescriptor,
}

#[derive(Default)]
struct LocalState {
    pool: Vec<PoolEntry>,
    active: Vec<String>,
    panels: Vec<(PanelId, CommandCallback)>,
    widgets: HashMap<WidgetId, ShownWidget>,
    close_listeners: HashMap<WidgetId, Vec<CloseListener>>,
    next_widget: u64,
}

/// Engine that lives entirely inside this process
pub struct LocalEngine {
    instance_name: String,
    config_location: PathBuf,
    panels: bool,
    state: RefCell<LocalState>,
}

impl LocalEngine {
    #[must_use]
    pub fn new(instance_name: impl Into<String>, config_location: impl Into<PathBuf>) -> Self {
        Self {
            instance_name: instance_name.into(),
            config_location: config_location.into(),
            panels: false,
            state: RefCell::new(LocalState::default()),
        }
    }

    /// Enable panel hosting
    #[must_use]
    pub fn with_panels(mut self) -> Self {
        self.panels = true;
        self
    }

    /// Invoke an active command the way a menu click would
    pub fn trigger(&self, name: &str) -> Result<()> {
        let callback = {
            let state = self.state.borrow();
            if !state.active.iter().any(|n| n == name) {
                bail!("command '{name}' is not active");
            }
            state
                .pool
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.callback.clone())
                .with_context(|| format!("command '{name}' is not registered"))?
        };
        callback()
    }

    /// Restore a panel by id, as a saved workspace would
    pub fn restore_panel(&self, panel: &PanelId) -> Result<()> {
        let callback = self
            .state
            .borrow()
            .panels
            .iter()
            .find(|(id, _)| id == panel)
            .map(|(_, cb)| cb.clone())
            .with_context(|| format!("unknown panel {panel:?}"))?;
        callback()
    }

    /// Rebuild menus for a new context, dropping every active entry
    pub fn reset_menus(&self) {
        self.state.borrow_mut().active.clear();
    }

    /// Close a shown widget, notifying subscribers first
    pub fn close_widget(&self, widget: WidgetId) -> Result<()> {
        let listeners = {
            let mut state = self.state.borrow_mut();
            if !state.widgets.contains_key(&widget) {
                bail!("no such widget {widget}");
            }
            state.close_listeners.remove(&widget).unwrap_or_default()
        };
        for listener in listeners {
            listener(widget);
        }
        if let Some(shown) = self.state.borrow_mut().widgets.remove(&widget) {
            debug!(widget = %widget, panel = ?shown.panel, title = %shown.title, "Widget closed");
        }
        Ok(())
    }

    #[must_use]
    pub fn owner_of(&self, name: &str) -> Option<Owner> {
        self.state
            .borrow()
            .pool
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.owner.clone())
    }

    #[must_use]
    pub fn properties_of(&self, name: &str) -> Option<Properties> {
        self.state
            .borrow()
            .pool
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.properties.clone())
    }

    /// Descriptor of a shown widget
    #[must_use]
    pub fn widget(&self, widget: WidgetId) -> Option<WidgetDescriptor> {
        self.state
            .borrow()
            .widgets
            .get(&widget)
            .map(|w| w.descriptor.clone())
    }

    /// Active commands grouped under their menu headings, in registration order
    #[must_use]
    pub fn menu(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.borrow();
        let mut menu: Vec<(String, Vec<String>)> = Vec::new();
        for entry in state.pool.iter().filter(|e| state.active.contains(&e.name)) {
            let group = &entry.owner.display_group;
            match menu.iter_mut().find(|(g, _)| g == group) {
                Some((_, names)) => names.push(entry.name.clone()),
                None => menu.push((group.clone(), vec![entry.name.clone()])),
            }
        }
        menu
    }
}

impl Engine for LocalEngine {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn config_location(&self) -> PathBuf {
        self.config_location.clone()
    }

    fn register_command(&self, registration: CommandRegistration) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let name = registration.name.clone();
        if let Some(existing) = state.pool.iter().find(|e| e.name == name) {
            if !existing.owner.is_same_owner(&registration.owner) {
                bail!(
                    "command '{}' is owned by group '{}' of another app",
                    name,
                    existing.owner.display_group
                );
            }
        }
        state.pool.retain(|e| e.name != name);
        state.pool.push(PoolEntry {
            name: registration.name,
            callback: registration.callback,
            properties: registration.properties,
            owner: registration.owner,
        });
        if !state.active.contains(&name) {
            state.active.push(name);
        }
        Ok(())
    }

    fn supports_panels(&self) -> bool {
        self.panels
    }

    fn register_panel(&self, name: &str, show: CommandCallback) -> Result<PanelId> {
        if !self.panels {
            bail!("engine '{}' cannot register panel '{}'", self.instance_name, name);
        }
        let id = PanelId(format!("{}_{}", self.instance_name, slug(name)));
        let mut state = self.state.borrow_mut();
        state.panels.retain(|(existing, _)| existing != &id);
        state.panels.push((id.clone(), show));
        Ok(id)
    }

    fn show_panel(
        &self,
        panel: &PanelId,
        title: &str,
        owner: &Owner,
        widget: WidgetDescriptor,
    ) -> Result<WidgetId> {
        let mut state = self.state.borrow_mut();
        if !state.panels.iter().any(|(id, _)| id == panel) {
            bail!("unknown panel {panel:?}");
        }
        let id = WidgetId(state.next_widget);
        state.next_widget += 1;
        debug!(widget = %id, title, group = %owner.display_group, kind = %widget.kind, "Showing panel");
        state.widgets.insert(
            id,
            ShownWidget {
                panel: panel.clone(),
                title: title.to_string(),
                descriptor: widget,
            },
        );
        Ok(id)
    }

    fn subscribe_close(&self, widget: WidgetId, listener: CloseListener) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.widgets.contains_key(&widget) {
            bail!("no such widget {widget}");
        }
        state.close_listeners.entry(widget).or_default().push(listener);
        Ok(())
    }

    fn command_pool(&self) -> Vec<PooledCommand> {
        self.state
            .borrow()
            .pool
            .iter()
            .map(|e| PooledCommand {
                name: e.name.clone(),
                owner: e.owner.clone(),
            })
            .collect()
    }

    fn active_commands(&self) -> Vec<String> {
        self.state.borrow().active.clone()
    }

    fn activate_command(&self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.pool.iter().any(|e| e.name == name) {
            bail!("command '{name}' is not in the pool");
        }
        if !state.active.iter().any(|n| n == name) {
            state.active.push(name.to_string());
        }
        Ok(())
    }
}

fn slug(name: &str) -> String {
    name.chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() || c == '-' || c == '_' {
                Some('_')
            } else {
                None
            }
        })
        .collect()
}
