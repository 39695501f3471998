//! Command and panel contracts implemented by plugin code
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::host::{Context, Engine, WidgetDescriptor, WidgetId};
use crate::paths::SearchPath;
use crate::plugins::identity::App;

/// Property keys the runtime understands
pub const ICON: &str = "icon";
pub const DESCRIPTION: &str = "description";
pub const GROUP: &str = "group";

/// Metadata attached to a command registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(serde_json::Map<String, serde_json::Value>);

impl Properties {
    /// Build from a JSON object; anything else yields empty properties
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(serde_json::Value::as_str)
    }

    #[must_use]
    pub fn icon(&self) -> Option<&str> {
        self.get_str(ICON)
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.get_str(DESCRIPTION)
    }

    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.get_str(GROUP).filter(|g| !g.is_empty())
    }

    /// Replace a relative `icon` with the first match under the search roots.
    ///
    /// Existing absolute files and unresolvable values are left untouched.
    pub fn resolve_icon(&mut self, search_path: &SearchPath) {
        let Some(icon) = self.icon() else {
            return;
        };
        let as_path = Path::new(icon);
        if as_path.is_absolute() && as_path.is_file() {
            return;
        }
        if let Some(found) = search_path.find(icon) {
            let resolved = found.to_string_lossy().into_owned();
            self.insert(ICON, serde_json::Value::String(resolved));
        }
    }
}

/// Whether a registration is a plain command or a panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Command,
    Panel,
}

impl CommandKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "Command",
            Self::Panel => "Panel",
        }
    }
}

/// Host objects visible to a command instance.
///
/// App and engine are weak: a command never keeps the host alive.
#[derive(Clone)]
pub struct HostBindings {
    pub app: Weak<App>,
    pub engine: Weak<dyn Engine>,
    pub context: Context,
}

impl HostBindings {
    #[must_use]
    pub fn new(app: &Rc<App>, engine: &Rc<dyn Engine>, context: Context) -> Self {
        Self {
            app: Rc::downgrade(app),
            engine: Rc::downgrade(engine),
            context,
        }
    }

    #[must_use]
    pub fn app(&self) -> Option<Rc<App>> {
        self.app.upgrade()
    }

    #[must_use]
    pub fn engine(&self) -> Option<Rc<dyn Engine>> {
        self.engine.upgrade()
    }
}

impl std::fmt::Debug for HostBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBindings")
            .field("app", &self.app.upgrade().map(|a| a.id()))
            .field(
                "engine",
                &self.engine.upgrade().map(|e| e.instance_name().to_string()),
            )
            .field("context", &self.context)
            .finish()
    }
}

/// A declarative menu command
pub trait Command {
    /// Display name; must be non-empty
    fn name(&self) -> &str;

    /// Metadata such as `icon` or `description`
    fn properties(&self) -> Properties;

    /// Whether this command applies to the current host state
    fn available(&self, _host: &HostBindings) -> bool {
        true
    }

    /// One-time setup before the command is handed to the host
    fn init(&mut self, _host: &HostBindings) -> Result<()> {
        Ok(())
    }

    /// Run the command
    fn execute(&mut self, host: &HostBindings) -> Result<()>;

    /// Called after the host switched context
    fn context_changed(&mut self, _host: &HostBindings, _old: &Context, _new: &Context) -> Result<()> {
        Ok(())
    }
}

/// A command whose execution yields a widget for the host to embed
pub trait Panel {
    fn name(&self) -> &str;

    fn properties(&self) -> Properties;

    fn available(&self, _host: &HostBindings) -> bool {
        true
    }

    fn init(&mut self, _host: &HostBindings) -> Result<()> {
        Ok(())
    }

    /// Describe the widget to construct; the host builds it
    fn execute(&mut self, host: &HostBindings) -> Result<WidgetDescriptor>;

    /// Called once the shown widget has been closed
    fn on_close(&mut self, _host: &HostBindings, _widget: WidgetId) -> Result<()> {
        Ok(())
    }

    fn context_changed(&mut self, _host: &HostBindings, _old: &Context, _new: &Context) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_properties_from_non_object() {
        assert_eq!(Properties::from_json(json!([1, 2])), Properties::default());
    }

    #[test]
    fn test_empty_group_is_ignored() {
        let props = Properties::from_json(json!({"group": ""}));
        assert_eq!(props.group(), None);
    }

    #[test]
    fn test_resolve_icon_found() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_string_lossy().replace('\\', "/");
        std::fs::create_dir_all(dir.path().join("icons")).unwrap();
        std::fs::write(dir.path().join("icons").join("x.png"), b"png").unwrap();

        let search = SearchPath::from(vec!["/does/not/exist".to_string(), root.clone()]);
        let mut props = Properties::from_json(json!({"icon": "icons/x.png"}));
        props.resolve_icon(&search);

        assert_eq!(props.icon(), Some(format!("{root}/icons/x.png").as_str()));
    }

    #[test]
    fn test_resolve_icon_missing_passes_through() {
        let search = SearchPath::from(vec!["/does/not/exist".to_string()]);
        let mut props = Properties::from_json(json!({"icon": "icons/x.png"}));
        props.resolve_icon(&search);
        assert_eq!(props.icon(), Some("icons/x.png"));
    }

    #[test]
    fn test_resolve_icon_without_icon_is_noop() {
        let search = SearchPath::from(vec!["/does/not/exist".to_string()]);
        let mut props = Properties::from_json(json!({"description": "hi"}));
        props.resolve_icon(&search);
        assert_eq!(props.description(), Some("hi"));
        assert_eq!(props.icon(), None);
    }
}
