//! Vega CLI - astronomy device-control runtime.
//!
//! Loads the component modules found under the module root, then
//! optionally runs a JSON task script against the loaded runtime.
//!
//! # Environment Variables
//!
//! - `VEGA_MODULE_PATH`: overrides the module root (default `./modules`)
//! - `RUST_LOG`: tracing filter (e.g. `vega_script=debug,info`)

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use vega_component::{AddonRegistry, ComponentRegistry};
use vega_event::MessageBus;
use vega_runtime::{ComponentManager, ModuleLoader, RuntimeConfig};
use vega_script::{TaskGenerator, TaskInterpreter};

/// Vega - astronomy device-control runtime
#[derive(Parser, Debug)]
#[command(name = "vega")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Module root directory (also: VEGA_MODULE_PATH)
    #[arg(short, long)]
    modules: Option<PathBuf>,

    /// Task script file to execute after startup
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Directory scripts import files from (defaults to the script's parent)
    #[arg(long)]
    task_dir: Option<PathBuf>,

    /// List loaded components and exit
    #[arg(long)]
    list_components: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut config = RuntimeConfig::default();
    if let Some(modules) = &args.modules {
        config = config.with_module_root(modules);
    }

    let event_capacity = config.event_queue_capacity;
    let loader = Arc::new(ModuleLoader::new());
    let addons = Arc::new(AddonRegistry::new());
    let registry = Arc::new(ComponentRegistry::new());
    let manager = ComponentManager::new(
        Arc::clone(&loader),
        Arc::clone(&addons),
        Arc::clone(&registry),
        config,
    );

    manager
        .initialize()
        .context("component manager startup failed")?;
    info!(components = manager.component_list().len(), "Runtime ready");

    if args.list_components {
        for name in manager.component_list() {
            println!("{name}");
        }
        return Ok(());
    }

    let Some(script_path) = &args.script else {
        info!("No script given, exiting");
        return Ok(());
    };

    let bus: MessageBus<Value> = MessageBus::with_capacity(event_capacity);
    let bus_consumer = bus.start();

    let interpreter = TaskInterpreter::with_event_capacity(event_capacity);
    interpreter.attach_bus(bus.clone());
    let task_dir = args
        .task_dir
        .clone()
        .or_else(|| script_path.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    interpreter.set_task_dir(task_dir);
    register_runtime_functions(&interpreter, &manager)?;

    let name = script_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "main".to_string());
    let text = std::fs::read_to_string(script_path)
        .with_context(|| format!("failed to read {}", script_path.display()))?;
    let mut program: Value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", script_path.display()))?;

    // Macro expansion happens before the script is loaded.
    let generator = TaskGenerator::new();
    generator
        .process_script(&mut program)
        .context("macro expansion failed")?;

    interpreter
        .load_script(&name, program)
        .with_context(|| format!("failed to load script {name}"))?;
    info!(script = %name, "Executing script");
    let result = interpreter.run(&name).await;

    bus.stop();
    let _ = bus_consumer.await;
    result.with_context(|| format!("script {name} failed"))?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).init();
}

/// Exposes the component runtime to scripts.
fn register_runtime_functions(
    interpreter: &TaskInterpreter,
    manager: &ComponentManager,
) -> Result<()> {
    let components = manager.component_list();
    interpreter
        .register_function("list_components", move |_| {
            Ok(Value::Array(
                components
                    .iter()
                    .map(|name| Value::String(name.clone()))
                    .collect(),
            ))
        })
        .context("registering list_components")?;
    Ok(())
}
