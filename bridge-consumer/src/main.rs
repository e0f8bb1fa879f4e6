//! Thin driver: load config, start the engine, serve metrics, wait for stop.

use std::future::ready;

use axum::routing::get;
use axum::Router;
use bridge_common::metrics::{serve, setup_metrics_routes};
use bridge_consumer::app::Application;
use bridge_consumer::config;
use bridge_consumer::error::BridgeError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    let config = config::load()?;

    let default_directive = if config.debug { "debug" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    let prometheus = config.prometheus.clone();

    let (mut app, mut stop) = Application::new(config).await?;
    app.start().await?;

    if let Some(prometheus) = prometheus {
        let liveness = app.health();
        let router = Router::new()
            .route("/", get(index))
            .route("/_readiness", get(index))
            .route("/_liveness", get(move || ready(liveness.get_status())));
        let router = setup_metrics_routes(router);
        tokio::task::spawn(async move {
            serve(router, &prometheus.server)
                .await
                .expect("failed to start serving metrics");
        });
    }

    // A broken broker connection or a fatally failed worker pushes the
    // sentinel; the monitor restarts the process.
    stop.recv().await;
    app.terminate().await;

    std::process::exit(1);
}

pub async fn index() -> &'static str {
    "rusty-bridge consumer"
}
