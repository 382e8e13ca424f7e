use std::sync::Arc;

use clap::Parser;
use ledgersim_adapters::{EventStream, NatsEventStream};
use ledgersim_core::{LedgerEngine, Store};
use ledgersim_service::config::Config;
use ledgersim_service::{build_router, fraud, publisher, ServiceState};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ledgersim_service=info,info".to_string()),
        )
        .init();

    let config = Config::parse();
    if let Some(endpoint) = &config.otel_exporter_otlp_endpoint {
        info!(endpoint, "OTLP exporter endpoint configured (telemetry bootstrap is out of scope)");
    }

    let store = Store::connect(&config.database_url).await?;
    store.ensure_schema().await?;
    let engine = Arc::new(LedgerEngine::new(store));

    let event_stream: Arc<dyn EventStream> =
        Arc::new(NatsEventStream::connect(&config.nats_url, "LEDGERSIM").await?);

    let state = ServiceState {
        engine: engine.clone(),
        event_stream: event_stream.clone(),
        admin_key: config.admin_key.clone(),
    };

    let cancel = CancellationToken::new();

    let publisher_task = tokio::spawn(publisher::run(engine.clone(), event_stream.clone(), cancel.child_token()));
    let fraud_task = tokio::spawn(fraud::run(engine.clone(), event_stream.clone(), cancel.child_token()));

    let app = build_router(state, &config.cors_origins());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("ledgersim-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    publisher_task.await?;
    fraud_task.await?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
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

    cancel.cancel();
}
