//! Kiln - a command plugin runtime
//!
//! Kiln discovers plugin files on a configurable search path, loads each one
//! in isolation, lets it register commands and panels with a host engine,
//! and keeps those commands bound to the host's current context until the
//! plugin subsystem is unloaded.
//!
//! # Modules
//!
//! - [`config`]: Configuration management and serialization
//! - [`paths`]: Search path resolution and resource lookup
//! - [`host`]: Interfaces consumed from the host engine, plus an in-process engine
//! - [`plugins`]: Loader, lifecycle manager, command/panel contracts and registry
//! - [`error`]: Error taxonomy for plugin failures

pub mod config;
pub mod error;
pub mod host;
pub mod paths;
pub mod plugins;

pub use config::Config;
pub use error::{PluginError, PluginResult};
pub use host::{Context, Engine, LocalEngine};
pub use paths::SearchPath;
pub use plugins::PluginManager;
