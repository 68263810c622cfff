use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub mod handlers;
mod pagination;

pub use pagination::Pagination;

use crate::AppContext;

/// Serves the HTTP API until `shutdown` resolves.
pub async fn start_server(
    ctx: Arc<AppContext>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = handlers::router(ctx);

    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
