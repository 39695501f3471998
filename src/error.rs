//! Error taxonomy for the plugin runtime.
//!
//! Every error raised across a plugin boundary is contained at file
//! granularity by the manager. `ContractViolation` is the exception: it is a
//! programmer error in a command definition and is surfaced as soon as the
//! definition is evaluated.

use std::path::PathBuf;
use thiserror::Error;

use crate::plugins::api::CommandKind;

/// Errors produced while loading, registering or tearing down plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A plugin file failed to execute or could not be opened.
    #[error("Failed to load plugin {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// A plugin's `register()` entry point failed.
    #[error("Failed to register plugin {path}: {message}")]
    Registration { path: PathBuf, message: String },

    /// A plugin's `unregister()` entry point failed.
    #[error("Failed to unregister plugin {path}: {message}")]
    Unregistration { path: PathBuf, message: String },

    /// A command or panel definition is missing a required member.
    #[error("Contract violation in {kind} definition: {message}")]
    ContractViolation { kind: &'static str, message: String },

    /// A command with the same name is already live and duplicates are rejected.
    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    /// The active engine cannot host panels.
    #[error("Engine '{0}' does not support panels")]
    PanelsUnsupported(String),

    /// A command's own `init`, `execute` or hook returned an error.
    #[error("Command '{name}' failed: {message}")]
    Execution { name: String, message: String },

    /// No live command carries this name.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A plain command was asked to show a panel.
    #[error("Command '{0}' is not a panel")]
    NotAPanel(String),

    /// The host engine has been dropped or refused a call.
    #[error("Host error: {0}")]
    Host(String),

    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Contract violation on a definition of the given kind.
    pub fn contract(kind: CommandKind, message: impl Into<String>) -> Self {
        Self::ContractViolation {
            kind: kind.as_str(),
            message: message.into(),
        }
    }
}

/// Result alias used throughout the plugin runtime.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_mentions_path() {
        let err = PluginError::Load {
            path: PathBuf::from("/commands/shared/broken.lua"),
            message: "unexpected symbol".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("broken.lua"));
        assert!(text.contains("unexpected symbol"));
    }

    #[test]
    fn test_contract_kind() {
        let err = PluginError::contract(CommandKind::Panel, "missing name");
        assert!(matches!(
            err,
            PluginError::ContractViolation { kind: "Panel", .. }
        ));
    }
}
