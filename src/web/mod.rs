use crate::error::{ConfigError, LoaderError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod ws;

pub use ws::{error_payload, MessageType, RouteHandler, WsRouter};

/// Serves the UI router on `host:port` until `shutdown` resolves.
pub async fn serve(
    router: Arc<WsRouter>,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        LoaderError::Config(ConfigError::Parse(format!("Invalid server address: {e}")))
    })?;

    tracing::info!("Starting UI router on {}", addr);

    let (_, server) = warp::serve(router.filter())
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| {
            LoaderError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("Failed to bind {addr}: {e}"),
            ))
        })?;
    server.await;

    tracing::info!("UI router stopped");
    Ok(())
}
