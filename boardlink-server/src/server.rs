//! Websocket listener.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{connection, context::AppContext, tracing::prelude::*};

/// Accept clients until `shutdown` fires.
///
/// Every connection runs on `tracker`, so waiting on the tracker also waits
/// for each connection to release what it holds.
pub async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<AppContext>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for clients");
    }

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    continue;
                }
            },
        };

        debug!(%addr, "New connection");
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => connection::serve(ws, ctx, shutdown).await,
                Err(e) => warn!(%addr, error = %e, "Websocket handshake failed"),
            }
        });
    }
}
