//! Ledgerline is a personal-finance ingestion and classification service.
//!
//! Financial documents (CSV statements, PDF statements, photographed
//! receipts) are parsed into a normalized stream of transactions, each
//! transaction is assigned a spending category with an auditable
//! explanation, and user corrections are turned into reusable
//! categorization rules.
//!
//! This library exposes a JSON REST API; see [build_router] for the routes.

use std::time::Duration;

use axum_server::Handle;
use tokio::signal;

pub mod account;
pub mod analytics;
pub mod app_state;
pub mod auth;
pub mod categorize;
pub mod category;
pub mod config;
pub mod csv;
pub mod endpoints;
pub mod envelope;
pub mod error;
pub mod import;
pub mod llm;
pub mod merchant;
pub mod routes;
pub mod rule;
pub mod split;
pub mod store;
pub mod suggestion;
pub mod transaction;

pub use app_state::AppState;
pub use config::Config;
pub use error::Error;
pub use routes::build_router;

/// An async task that waits for either the ctrl+c or terminate signal,
/// whichever comes first, and then signals the server to shut down
/// gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}
