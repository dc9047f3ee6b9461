use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE: &str = "loader.log";

fn env_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env();
    match format!("plugin_loader={level}").parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Logging for the host process: stderr plus, when `log_dir` is set, a daily
/// rotated file. Keep the returned guard alive to flush the file writer.
pub fn init_host(config: &Config, debug: bool) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    if let Err(e) = result {
        eprintln!("Logging already initialised: {e}");
    }

    guard
}

/// Logging for a sandbox process; output is inherited by the host's stderr.
pub fn init_sandbox(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
