use mentatlab_server::config::ServerConfig;
use mentatlab_server::state::AppState;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(port = config.port, runstore = %config.orch_runstore, "loaded configuration");

    let shutdown_grace = Duration::from_secs(config.shutdown_grace);

    let state = match AppState::build(&config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to construct run store");
            std::process::exit(1);
        }
    };

    let app = mentatlab_server::routes::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr, "failed to bind listen address");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "listening");

    let serve_task = tokio::spawn(async move { axum::serve(listener, app).await });

    shutdown_signal().await;
    tracing::info!(?shutdown_grace, "shutdown signal received, draining");

    tokio::select! {
        result = serve_task => {
            match result {
                Ok(Ok(())) => tracing::info!("server shut down cleanly"),
                Ok(Err(err)) => tracing::error!(error = %err, "server error"),
                Err(err) => tracing::error!(error = %err, "server task panicked"),
            }
        }
        () = tokio::time::sleep(shutdown_grace) => {
            tracing::warn!("shutdown grace period elapsed; forcing exit");
        }
    }
}

/// Resolves on `SIGTERM` or Ctrl+C — the moment `main` starts the
/// `shutdown_grace` countdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {},
        () = terminate => {},
    }
}
