//! End-to-end checks of context propagation, display grouping and panels
//!
//! Each test writes small Lua plugins into a temporary search root and drives
//! them through an in-process engine.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use kiln::host::{Context, Engine, LocalEngine};
use kiln::plugins::{FailureStage, PluginManager};
use kiln::{Config, SearchPath};
use serde_json::json;
use tempfile::tempdir;

fn write(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn context(out: &Path, shot: &str) -> Context {
    Context::new(json!({"out": out.to_string_lossy(), "shot": shot, "user": {"name": "ada"}}))
}

fn load(engine: &Rc<LocalEngine>, root: &Path, initial: Context) -> PluginManager {
    let dyn_engine: Rc<dyn Engine> = engine.clone();
    let roots = vec![root.to_string_lossy().replace('\\', "/")];
    let mut manager =
        PluginManager::with_search_path(dyn_engine, initial, Config::default(), SearchPath::from(roots));
    manager.load_all();
    assert!(manager.failures().is_empty(), "{:?}", manager.failures());
    manager
}

const TRACKER: &str = r#"
local kiln = require("kiln")

local function append(path, line)
    local f = assert(io.open(path, "a"))
    f:write(line .. "\n")
    f:close()
end

local Tracker = kiln.app.Command {
    name = "Tracker",
    properties = {},
    execute = function(self)
        append(self.context.out, "run " .. self.context.shot .. " module " .. kiln.context.shot .. " global " .. context.shot)
    end,
    context_changed = function(self, old, new)
        append(self.context.out, "changed " .. old.shot .. " -> " .. new.shot .. " bound " .. self.context.shot)
    end,
}

function register()
    Tracker:register()
end

function context_changed(old, new)
    module_saw = new.shot
end
"#;

/// Test context propagation to commands and plugin namespaces
#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn test_context_change_reaches_every_instance_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(dir.path(), "shared/tracker.lua", TRACKER);

        let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let mut manager = load(&engine, dir.path(), context(&out, "010"));

        let old = context(&out, "010");
        let new = context(&out, "020");
        manager.propagate_context_change(&old, &new);

        let instance = manager.host().registry().get("Tracker").unwrap();
        assert_eq!(instance.context(), new);
        assert_eq!(manager.host().context(), new);

        manager.run_command("Tracker").unwrap();
        let log = fs::read_to_string(&out).unwrap();
        assert_eq!(
            log,
            "changed 010 -> 020 bound 020\nrun 020 module 020 global 020\n"
        );
    }

    #[test]
    fn test_failing_hook_does_not_stop_propagation() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(
            dir.path(),
            "shared/a_fragile.lua",
            r#"
local kiln = require("kiln")
local Fragile = kiln.app.Command {
    name = "Fragile",
    properties = {},
    execute = function() end,
    context_changed = function() error("cannot follow") end,
}
function register() Fragile:register() end
"#,
        );
        write(dir.path(), "shared/b_tracker.lua", TRACKER);

        let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let mut manager = load(&engine, dir.path(), context(&out, "010"));
        manager.switch_context(context(&out, "030"));

        let failures = manager.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, FailureStage::ContextChange);
        assert!(failures[0].path.ends_with("a_fragile.lua"));

        let log = fs::read_to_string(&out).unwrap();
        assert_eq!(log, "changed 010 -> 030 bound 030\n");
    }

    #[test]
    fn test_reattach_after_menu_reset() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(dir.path(), "shared/tracker.lua", TRACKER);

        let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let mut manager = load(&engine, dir.path(), context(&out, "010"));

        engine.reset_menus();
        assert!(engine.trigger("Tracker").is_err());

        let reattached = manager.switch_context(context(&out, "040"));
        assert_eq!(reattached, 1);
        engine.trigger("Tracker").unwrap();
        assert!(fs::read_to_string(&out).unwrap().ends_with("run 040 module 040 global 040\n"));
    }
}

/// Test display grouping of independently loaded plugins
#[cfg(test)]
mod grouping_tests {
    use super::*;

    fn grouped(name: &str, group: &str) -> String {
        format!(
            "local kiln = require('kiln')\n\
             local C = kiln.app.Command {{ name = '{name}', properties = {{ group = '{group}' }}, execute = function() end }}\n\
             function register() C:register() end\n"
        )
    }

    #[test]
    fn test_same_group_from_different_files() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(dir.path(), "shared/review_a.lua", &grouped("Open Review", "Review"));
        write(dir.path(), "shared/review_b.lua", &grouped("Close Review", "Review"));
        write(
            dir.path(),
            "shared/plain.lua",
            "local kiln = require('kiln')\n\
             local C = kiln.app.Command { name = 'Plain', properties = {}, execute = function() end }\n\
             function register() C:register() end\n",
        );

        let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let manager = load(&engine, dir.path(), context(&out, "010"));

        let a = engine.owner_of("Open Review").unwrap();
        let b = engine.owner_of("Close Review").unwrap();
        assert_eq!(a.display_group, "Review");
        assert!(a.is_same_owner(&b));
        assert_eq!(a.app_id, manager.host().app().id());

        assert_eq!(engine.owner_of("Plain").unwrap().display_group, "Commands");
        assert_eq!(
            engine.menu(),
            vec![
                ("Commands".to_string(), vec!["Plain".to_string()]),
                (
                    "Review".to_string(),
                    vec!["Open Review".to_string(), "Close Review".to_string()]
                ),
            ]
        );
        assert_eq!(manager.host().app().display_name(), "Commands");
    }
}

/// Test panel show and close flow
#[cfg(test)]
mod panel_tests {
    use super::*;

    const PANEL: &str = r#"
local kiln = require("kiln")

local SayHelloPanel = kiln.app.Panel {
    name = "Say Hello Panel...",
    properties = { description = "Greet the current user with a message." },
    execute = function(self)
        return "SayHelloUI", { self.context.user.name }, { alignment = "center" }
    end,
    on_close = function(self, widget)
        local f = assert(io.open(self.context.out, "a"))
        f:write("closed " .. tostring(widget) .. "\n")
        f:close()
    end,
}

function register()
    SayHelloPanel:register()
end
"#;

    #[test]
    fn test_panel_show_then_close() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(dir.path(), "tk-nuke/say_hello_panel.lua", PANEL);

        let engine = Rc::new(LocalEngine::new("tk-nuke", "/cfg").with_panels());
        let manager = load(&engine, dir.path(), context(&out, "010"));

        let widget = manager.run_command("Say Hello Panel...").unwrap().unwrap();
        let descriptor = engine.widget(widget).unwrap();
        assert_eq!(descriptor.kind, "SayHelloUI");
        assert_eq!(descriptor.args, vec![json!("ada")]);
        assert_eq!(descriptor.kwargs.get("alignment"), Some(&json!("center")));

        let instance = manager.host().registry().get("Say Hello Panel...").unwrap();
        assert_eq!(instance.widget(), Some(widget));

        engine.close_widget(widget).unwrap();
        assert_eq!(instance.widget(), None);
        assert_eq!(fs::read_to_string(&out).unwrap(), format!("closed {}\n", widget.0));

        let again = manager.show_panel("Say Hello Panel...").unwrap();
        assert_ne!(again, widget);
        assert_eq!(instance.widget(), Some(again));
    }

    #[test]
    fn test_panel_on_engine_without_panels() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write(dir.path(), "shared/say_hello_panel.lua", PANEL);

        let engine = Rc::new(LocalEngine::new("tk-shell", "/cfg"));
        let dyn_engine: Rc<dyn Engine> = engine.clone();
        let roots = vec![dir.path().to_string_lossy().replace('\\', "/")];
        let mut manager = PluginManager::with_search_path(
            dyn_engine,
            context(&out, "010"),
            Config::default(),
            SearchPath::from(roots),
        );
        manager.load_all();

        assert_eq!(manager.units().len(), 1);
        assert!(manager.command_names().is_empty());
        assert_eq!(manager.failures()[0].stage, FailureStage::Register);
        assert!(manager.failures()[0].message.contains("does not support panels"));
    }
}
