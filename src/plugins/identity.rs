//! Owner attribution for registered commands.
//!
//! The host groups menu entries by owner. Plugins loaded independently of
//! each other are shown under one heading by attributing each registration
//! to a display group instead of to the application itself. The group is
//! carried explicitly in an [`Owner`] value, and while a registration is in
//! flight the application reports the group as its display name.

use std::cell::RefCell;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::config::DisplayGroupConfig;
use crate::host::Engine;
use crate::paths::SearchPath;
use crate::plugins::api::{CommandKind, Properties};

/// The application that owns every command this runtime registers.
pub struct App {
    id: Uuid,
    display_name: String,
    search_path: SearchPath,
    group_override: RefCell<Option<String>>,
}

impl App {
    #[must_use]
    pub fn new(display_name: impl Into<String>, search_path: SearchPath) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            search_path,
            group_override: RefCell::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display name as the host currently sees it.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.group_override
            .borrow()
            .clone()
            .unwrap_or_else(|| self.display_name.clone())
    }

    /// The configured display name, ignoring any active group scope.
    #[must_use]
    pub fn real_display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    /// Resolve a path relative to the plugin search roots.
    #[must_use]
    pub fn get_resource(&self, relative: &str) -> Option<std::path::PathBuf> {
        self.search_path.find(relative)
    }

    /// The owner value handed to the host right now.
    #[must_use]
    pub fn owner(&self) -> Owner {
        Owner {
            app_id: self.id,
            display_group: self.display_name(),
        }
    }

    /// Report `group` as display name until the returned guard drops.
    ///
    /// The previous value is restored exactly on drop, also when the
    /// registration inside the scope fails or unwinds.
    pub fn scoped_display_group(&self, group: impl Into<String>) -> GroupScope<'_> {
        let previous = self.group_override.replace(Some(group.into()));
        GroupScope {
            app: self,
            previous,
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("id", &self.id)
            .field("display_name", &self.display_name())
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`App::scoped_display_group`].
#[must_use = "the display group is only active while the guard lives"]
pub struct GroupScope<'a> {
    app: &'a App,
    previous: Option<String>,
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        self.app.group_override.replace(self.previous.take());
    }
}

/// Logical owner of a registered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub app_id: Uuid,
    pub display_group: String,
}

impl Owner {
    /// Host-side "same owner" check: identical application, or the same
    /// display group.
    #[must_use]
    pub fn is_same_owner(&self, other: &Owner) -> bool {
        self.app_id == other.app_id || self.display_group == other.display_group
    }
}

/// Pick the display group for a registration.
///
/// The command's own `group` property wins, then the configured heading for
/// its kind, then the application's display name.
#[must_use]
pub fn display_group(
    properties: &Properties,
    kind: CommandKind,
    groups: &DisplayGroupConfig,
    app: &App,
) -> String {
    if let Some(group) = properties.group() {
        return group.to_string();
    }
    let by_kind = match kind {
        CommandKind::Command => groups.command.as_deref(),
        CommandKind::Panel => groups.panel.as_deref(),
    };
    by_kind
        .map(str::to_string)
        .unwrap_or_else(|| app.real_display_name().to_string())
}

/// Put every pooled command owned by `app`, or sharing its display name,
/// back into the engine's active set.
///
/// The host may drop commands registered under a display group when it
/// rebuilds its menus on a context switch. Returns how many were re-attached.
pub fn reattach_commands(engine: &dyn Engine, app: &App) -> usize {
    let active = engine.active_commands();
    let owner = app.owner();
    let mut reattached = 0;

    for pooled in engine.command_pool() {
        if !pooled.owner.is_same_owner(&owner) || active.contains(&pooled.name) {
            continue;
        }
        match engine.activate_command(&pooled.name) {
            Ok(()) => {
                debug!(command = %pooled.name, group = %pooled.owner.display_group, "Re-attached command");
                reattached += 1;
            }
            Err(e) => {
                debug!(command = %pooled.name, error = %e, "Failed to re-attach command");
            }
        }
    }

    reattached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandRegistration, LocalEngine};
    use serde_json::json;
    use std::rc::Rc;

    fn app() -> App {
        App::new("Commands", SearchPath::default())
    }

    #[test]
    fn test_scope_restores_display_name() {
        let app = app();
        {
            let _scope = app.scoped_display_group("Lighting");
            assert_eq!(app.display_name(), "Lighting");
            assert_eq!(app.owner().display_group, "Lighting");
        }
        assert_eq!(app.display_name(), "Commands");
    }

    #[test]
    fn test_nested_scopes_restore_in_order() {
        let app = app();
        let outer = app.scoped_display_group("Outer");
        {
            let _inner = app.scoped_display_group("Inner");
            assert_eq!(app.display_name(), "Inner");
        }
        assert_eq!(app.display_name(), "Outer");
        drop(outer);
        assert_eq!(app.display_name(), "Commands");
    }

    #[test]
    fn test_scope_restored_after_failure() {
        let app = app();
        let result: anyhow::Result<()> = (|| {
            let _scope = app.scoped_display_group("Broken");
            anyhow::bail!("host refused registration")
        })();
        assert!(result.is_err());
        assert_eq!(app.display_name(), "Commands");
    }

    #[test]
    fn test_same_owner_by_identity_or_group() {
        let a = app();
        let b = app();
        let owner_a = Owner { app_id: a.id(), display_group: "Tools".into() };
        let owner_a_other = Owner { app_id: a.id(), display_group: "Other".into() };
        let owner_b = Owner { app_id: b.id(), display_group: "Tools".into() };
        let stranger = Owner { app_id: b.id(), display_group: "Else".into() };

        assert!(owner_a.is_same_owner(&owner_a_other));
        assert!(owner_a.is_same_owner(&owner_b));
        assert!(!owner_a.is_same_owner(&stranger));
    }

    #[test]
    fn test_display_group_precedence() {
        let app = app();
        let mut groups = DisplayGroupConfig::default();
        let grouped = Properties::from_json(json!({"group": "Review"}));
        let plain = Properties::default();

        assert_eq!(display_group(&grouped, CommandKind::Panel, &groups, &app), "Review");
        assert_eq!(display_group(&plain, CommandKind::Panel, &groups, &app), "Commands");

        groups.panel = Some("Panels".into());
        assert_eq!(display_group(&plain, CommandKind::Panel, &groups, &app), "Panels");
        assert_eq!(display_group(&plain, CommandKind::Command, &groups, &app), "Commands");
    }

    #[test]
    fn test_reattach_skips_other_apps() {
        let engine = LocalEngine::new("tk-shell", "/cfg");
        let ours = app();
        let theirs = App::new("Lighting", SearchPath::default());
        let register = |name: &str, owner: Owner| {
            engine
                .register_command(CommandRegistration {
                    name: name.to_string(),
                    callback: Rc::new(|| Ok(())),
                    properties: Properties::default(),
                    owner,
                })
                .unwrap();
        };

        {
            let _scope = ours.scoped_display_group("Review");
            register("Open Review", ours.owner());
        }
        register("Relight", theirs.owner());
        engine.reset_menus();

        assert_eq!(reattach_commands(&engine, &ours), 1);
        assert_eq!(engine.active_commands(), vec!["Open Review".to_string()]);
        assert!(engine.trigger("Relight").is_err());
    }
}
