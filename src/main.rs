use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kiln::host::{Context, Engine, LocalEngine};
use kiln::{Config, PluginManager};

/// Kiln - load command plugins and drive them from the shell
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Root of the pipeline configuration; `<root>/commands` is searched last
    #[arg(short, long)]
    pipeline_config: PathBuf,

    /// Engine instance name, selects `<root>/<engine>/` plugin folders
    #[arg(short, long, default_value = "tk-shell")]
    engine: String,

    /// Let the engine host panels
    #[arg(long)]
    panels: bool,

    /// Initial context as JSON
    #[arg(long, default_value = "null")]
    context: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List live commands under their menu headings
    List,
    /// Run a command, or show a panel
    Run {
        /// Command name as shown in the menu
        name: String,
    },
    /// Show a panel
    Show {
        /// Panel name as shown in the menu
        name: String,
    },
    /// Switch context, then run the named commands
    Switch {
        /// New context as JSON
        context: String,
        /// Commands to run after the switch
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so command output stays clean
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    // Load configuration
    let config = if let Some(config_path) = args.config {
        Config::load_from_file(&config_path)?
    } else {
        Config::load_default()?
    };

    let context = parse_context(&args.context)?;

    let mut engine = LocalEngine::new(args.engine, args.pipeline_config);
    if args.panels {
        engine = engine.with_panels();
    }
    let engine = Rc::new(engine);
    let dyn_engine: Rc<dyn Engine> = engine.clone();

    let mut manager = PluginManager::new(dyn_engine, context, config);
    manager.load_all();

    match args.action {
        Action::List => print_menu(&engine, &manager),
        Action::Run { name } => run(&manager, &name)?,
        Action::Show { name } => {
            let widget = manager.show_panel(&name)?;
            if let Some(descriptor) = engine.widget(widget) {
                println!("{name}: shown as {widget} ({})", descriptor.kind);
            }
            engine.close_widget(widget)?;
        }
        Action::Switch { context, names } => {
            let new = parse_context(&context)?;
            // A real host rebuilds its menus on a context switch
            engine.reset_menus();
            let reattached = manager.switch_context(new);
            println!("Context switched, {reattached} command(s) re-attached");
            for name in names {
                run(&manager, &name)?;
            }
        }
    }

    manager.unload_all();
    Ok(())
}

fn parse_context(raw: &str) -> Result<Context> {
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid context JSON: {raw}"))?;
    Ok(Context::new(value))
}

fn run(manager: &PluginManager, name: &str) -> Result<()> {
    match manager.run_command(name)? {
        Some(widget) => println!("{name}: shown as {widget}"),
        None => println!("{name}: done"),
    }
    Ok(())
}

fn print_menu(engine: &LocalEngine, manager: &PluginManager) {
    for (group, names) in engine.menu() {
        println!("{group}");
        for name in names {
            let description = engine
                .properties_of(&name)
                .and_then(|p| p.description().map(str::to_string))
                .unwrap_or_default();
            println!("  {name:<32} {description}");
        }
    }

    for failure in manager.failures() {
        eprintln!(
            "{} failed during {}: {}",
            failure.path.display(),
            failure.stage,
            failure.message
        );
    }
}
