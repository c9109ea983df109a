//! Operator entrypoint: wire the substrate, the orchestrator, and the HTTP
//! surface together and serve until told to stop.

use std::sync::Arc;

use tracing::{info, warn};

use sim_operator::dispatcher::Dispatcher;
use sim_operator::orchestrator::kubernetes::KubernetesOrchestrator;
use sim_operator::substrate::postgres::PostgresSubstrate;
use sim_operator::web::{build_router, AppState};
use sim_operator::{logging, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = OperatorConfig::from_env()?;
    info!(namespace = %config.namespace, port = config.port, "starting sim-operator");

    let substrate = PostgresSubstrate::connect(&config.substrate_uri).await?;
    substrate.spawn_pruner(config.result_ttl);

    let orchestrator = KubernetesOrchestrator::new(config.namespace.clone()).await?;

    let port = config.port;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(orchestrator),
        Arc::new(substrate),
        config,
    ));

    dispatcher.check_substrate().await?;
    if let Err(e) = dispatcher.prune_workers().await {
        warn!(error = %e, "failed to survey leftover workers");
    }

    // Subscribe before accepting requests so no relay announcement can
    // slip past while the server is coming up.
    let relay = dispatcher.start_relay_listener().await?;

    let app = build_router(AppState::new(Arc::clone(&dispatcher)));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, draining deliveries");
    dispatcher.shutdown().await;
    relay.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
