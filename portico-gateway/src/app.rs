//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::net::SocketAddr;

use axum::middleware;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::state::GatewayContext;
use crate::tunnel::lifecycle;
use crate::{admin, edge};

/// Run the gateway until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_domain = %config.base_domain,
        listen_port = config.listen_port,
        "portico-gateway starting"
    );

    let ctx = GatewayContext::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweepers = lifecycle::spawn_sweepers(ctx.clone(), shutdown_rx.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening");

    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut serve_shutdown = shutdown_rx;
    axum::serve(listener, build_router(ctx.clone()))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await?;

    // Complete every in-flight request before the process exits.
    info!("draining tunnel sessions");
    lifecycle::drain_all(&ctx.registry);
    for handle in sweepers {
        let _ = handle.await;
    }

    info!("portico-gateway stopped");
    Ok(())
}

/// Admin router behind the host-routing edge middleware.
pub fn build_router(ctx: GatewayContext) -> Router {
    admin::router(ctx.clone())
        .layer(middleware::from_fn_with_state(ctx, edge::host_router))
        .layer(TraceLayer::new_for_http())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
