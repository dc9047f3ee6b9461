use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use plugin_loader::config;
use plugin_loader::logging;
use plugin_loader::plugin::{Loader, SupervisorContext};
use plugin_loader::sandbox::{self, SandboxSpec};
use plugin_loader::web::{self, WsRouter};

#[derive(Parser, Debug)]
#[command(name = "plugin-loader")]
#[command(about = "Runs sandboxed plugins and serves the UI RPC router", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (TOML/JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Load plugins and serve the UI router (default)
    Run,
    /// Host a single plugin; started by the loader itself
    #[command(hide = true)]
    Sandbox {
        /// JSON description of the plugin to host
        #[arg(long)]
        spec: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start runtime")?;
            runtime.block_on(run_host(args.config, args.debug))
        }
        Command::Sandbox { spec } => {
            logging::init_sandbox(args.debug);
            let spec = SandboxSpec::from_json(&spec)?;
            // Plugin code gets one thread; isolation between plugins comes from processes
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to start runtime")?;
            let result = runtime.block_on(sandbox::run_sandbox(spec));
            // Plugin code may still occupy blocking threads (a looping main hook);
            // those are abandoned instead of joined so the process can exit
            runtime.shutdown_background();
            result.context("Sandbox exited with an error")
        }
    }
}

async fn run_host(config_path: Option<PathBuf>, debug: bool) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    }
    .context("Failed to load configuration")?;

    let _log_guard = logging::init_host(&config, debug);
    if let Some(path) = &config_path {
        info!("Configuration loaded from {}", path.display());
    }
    info!(
        plugin_path = %config.plugin_path.display(),
        user = %config.host_user(),
        "Starting plugin loader"
    );

    let router = Arc::new(WsRouter::new());
    let context = SupervisorContext::from_config(&config)?;
    let loader = Loader::new(context, router.clone());
    loader.register_routes(&router);

    tokio::fs::create_dir_all(&config.plugin_path)
        .await
        .with_context(|| format!("Failed to create {}", config.plugin_path.display()))?;

    if config.live_reload {
        if let Err(e) = loader.start_watcher(config.reload_grace()) {
            warn!("Hot reload unavailable: {}", e);
        }
    }

    let count = loader.import_plugins().await?;
    info!("Loaded {} plugins", count);

    web::serve(
        router,
        &config.server.host,
        config.server.port,
        plugin_loader::shutdown_signal(),
    )
    .await?;

    info!("Shutting down");
    loader.shutdown_plugins().await;
    Ok(())
}
