use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context as _, Result};
use kiln::host::Context;
use kiln::plugins::{Command, HostApi, HostBindings, NativePlugin, Properties};

/// Append one line to the file named by the context's `out` entry
fn append(out: &str, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(out)
        .with_context(|| format!("Failed to open {out}"))?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn out_file(context: &Context) -> Result<String> {
    context
        .value()
        .get("out")
        .and_then(|out| out.as_str())
        .map(str::to_string)
        .context("context has no 'out' entry")
}

fn shot(context: &Context) -> &str {
    context
        .value()
        .get("shot")
        .and_then(|shot| shot.as_str())
        .unwrap_or("none")
}

/// Hello Native command - writes a line per call to the context's `out` file
struct Greeting {
    out: Option<String>,
}

impl Command for Greeting {
    fn name(&self) -> &str {
        "Hello Native"
    }

    fn properties(&self) -> Properties {
        let mut properties = Properties::default();
        properties.insert("description", "Greeting from a native plugin".into());
        properties
    }

    fn init(&mut self, host: &HostBindings) -> Result<()> {
        self.out = Some(out_file(&host.context)?);
        Ok(())
    }

    fn execute(&mut self, host: &HostBindings) -> Result<()> {
        append(&out_file(&host.context)?, &format!("execute {}", shot(&host.context)))
    }

    fn context_changed(&mut self, host: &HostBindings, old: &Context, new: &Context) -> Result<()> {
        append(&out_file(&host.context)?, &format!("changed {} -> {}", shot(old), shot(new)))
    }
}

impl Drop for Greeting {
    fn drop(&mut self) {
        if let Some(out) = &self.out {
            let _ = append(out, "dropped");
        }
    }
}

/// Hello Native plugin - registers one command
pub struct HelloNative;

impl NativePlugin for HelloNative {
    fn name(&self) -> &str {
        "Hello Native"
    }

    fn register(&mut self, host: &dyn HostApi) -> Result<()> {
        append(&out_file(&host.context())?, &format!("register on {}", host.engine_name()))?;
        host.register_command(Box::new(Greeting { out: None }))?;
        Ok(())
    }

    fn unregister(&mut self, host: &dyn HostApi) -> Result<()> {
        append(&out_file(&host.context())?, "unregister")
    }

    fn context_changed(&mut self, host: &dyn HostApi, old: &Context, new: &Context) -> Result<()> {
        append(
            &out_file(&host.context())?,
            &format!("plugin changed {} -> {}", shot(old), shot(new)),
        )
    }
}

/// Plugin entry point
#[no_mangle]
pub fn _kiln_plugin_create() -> *mut dyn NativePlugin {
    Box::into_raw(Box::new(HelloNative))
}
