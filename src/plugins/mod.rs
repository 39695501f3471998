// Plugin system: command plugins discovered on the search path.
// - Lua scripts, each executed in its own Lua state
// - Native libraries loaded with libloading
// - Commands and panels registered with the host engine through PluginHost
pub mod api;
pub mod host;
pub mod identity;
pub mod loader;
pub mod lua;
pub mod manager;
pub mod registry;

pub use api::{Command, CommandKind, HostBindings, Panel, Properties};
pub use host::{HostApi, PluginHost, Registration};
pub use identity::{App, Owner};
pub use loader::{NativePlugin, PluginCreate, PluginUnit};
pub use manager::{FailureStage, PluginFailure, PluginManager};
pub use registry::{CommandInstance, CommandRegistry, SharedInstance};
