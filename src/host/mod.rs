//! Interfaces consumed from the host engine.
//!
//! The engine owns the actual command registry, menu dispatch and panel
//! hosting. The plugin runtime only calls into it through [`Engine`].

pub mod local;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use crate::plugins::api::Properties;
use crate::plugins::identity::Owner;

pub use local::LocalEngine;

/// The active pipeline context.
///
/// Opaque to the runtime: it is only stored, swapped on a context change
/// and handed to plugin code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(serde_json::Value);

impl Context {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Context {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked by the host when a command is triggered.
pub type CommandCallback = Rc<dyn Fn() -> Result<()>>;

/// Listener invoked when a hosted widget closes.
pub type CloseListener = Box<dyn FnOnce(WidgetId)>;

/// Host-assigned panel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PanelId(pub String);

/// Host-assigned handle for a shown widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WidgetId(pub u64);

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "widget#{}", self.0)
    }
}

/// What a panel's `execute` hands to the host for construction: the widget
/// kind plus positional and keyword arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetDescriptor {
    pub kind: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl WidgetDescriptor {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }
}

/// A command submitted to the host registry.
pub struct CommandRegistration {
    pub name: String,
    pub callback: CommandCallback,
    pub properties: Properties,
    /// Logical owner the host attributes the command to.
    pub owner: Owner,
}

impl fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// An entry of the host's internal command pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledCommand {
    pub name: String,
    pub owner: Owner,
}

/// The host engine as seen from the plugin runtime.
///
/// All methods take `&self`: plugin code re-enters the engine while it is
/// being driven, so implementations use interior mutability.
pub trait Engine {
    /// Name of the running engine instance, e.g. `tk-nuke`.
    fn instance_name(&self) -> &str;

    /// Root of the active pipeline configuration.
    fn config_location(&self) -> PathBuf;

    /// Register a callable under a display name.
    fn register_command(&self, registration: CommandRegistration) -> Result<()>;

    /// Whether this engine can host panels.
    fn supports_panels(&self) -> bool {
        false
    }

    /// Reserve a panel slot. `show` is what the host calls to restore the panel.
    fn register_panel(&self, name: &str, show: CommandCallback) -> Result<PanelId> {
        let _ = show;
        anyhow::bail!("engine '{}' cannot register panel '{}'", self.instance_name(), name)
    }

    /// Construct and show a panel widget.
    fn show_panel(
        &self,
        panel: &PanelId,
        title: &str,
        owner: &Owner,
        widget: WidgetDescriptor,
    ) -> Result<WidgetId> {
        let _ = (title, owner, widget);
        anyhow::bail!("engine '{}' cannot show panel {:?}", self.instance_name(), panel)
    }

    /// Subscribe to the close event of a shown widget.
    ///
    /// Listeners run before the host's own close handling.
    fn subscribe_close(&self, widget: WidgetId, listener: CloseListener) -> Result<()> {
        let _ = listener;
        anyhow::bail!("engine '{}' has no widget {}", self.instance_name(), widget)
    }

    /// Every command the host has ever been given, active or not.
    fn command_pool(&self) -> Vec<PooledCommand>;

    /// Names of the commands currently in the active set.
    fn active_commands(&self) -> Vec<String>;

    /// Put a pooled command back into the active set.
    fn activate_command(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_is_transparent() {
        let context = Context::new(json!({"project": "alpha"}));
        let text = serde_json::to_string(&context).unwrap();
        assert_eq!(text, r#"{"project":"alpha"}"#);
    }

    #[test]
    fn test_widget_descriptor_defaults() {
        let descriptor: WidgetDescriptor = serde_json::from_value(json!({"kind": "Label"})).unwrap();
        assert_eq!(descriptor, WidgetDescriptor::new("Label"));
    }
}
