use std::net::SocketAddr;
use std::process::ExitCode;

use axum_server::Handle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ledgerline::{build_router, graceful_shutdown, AppState, Config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("Invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };

    if config.allow_local_dev_bypass {
        tracing::warn!("Local dev auth bypass is enabled. Do not run this in production.");
    }

    tracing::info!(
        "Starting ledgerline for project '{}' in region '{}'",
        config.project_id,
        config.region
    );

    let port = config.port;
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(error) => {
            tracing::error!("Could not initialize the application state: {error}");
            return ExitCode::FAILURE;
        }
    };

    let app = build_router(state);

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {addr}");

    if let Err(error) = axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
    {
        tracing::error!("Server error: {error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
