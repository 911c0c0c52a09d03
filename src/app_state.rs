//! Implements the struct that holds the state of the REST server.

use std::sync::Arc;

use axum::extract::FromRef;
use rusqlite::Connection;

use crate::{
    auth::AuthState, category::seed_default_categories, config::Config, llm::LlmClient,
    store::Store, Error,
};

/// The state of the REST server.
///
/// Collaborators are injected here once at start up; request handlers pull
/// the slices they need through [FromRef] substates.
#[derive(Clone)]
pub struct AppState {
    /// The runtime configuration.
    pub config: Arc<Config>,
    /// The store adapter.
    pub store: Store,
    /// The LLM adapter, shared process-wide.
    pub llm: Arc<LlmClient>,
}

impl AppState {
    /// Create a new [AppState] from the runtime configuration.
    ///
    /// Opens the embedded store at `config.database_path`, creates any
    /// missing schema, and seeds the default categories.
    ///
    /// # Errors
    /// Returns an error if the store cannot be opened or initialized.
    pub fn new(config: Config) -> Result<Self, Error> {
        let connection = if config.database_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.database_path)?
        };

        let store = Store::new(connection)?;
        seed_default_categories(&store.lock())?;

        let llm = Arc::new(LlmClient::from_config(&config));

        Ok(Self {
            config: Arc::new(config),
            store,
            llm,
        })
    }

    /// Build a state around an existing store and LLM client. Tests use
    /// this to substitute collaborators explicitly.
    pub fn with_parts(config: Config, store: Store, llm: Arc<LlmClient>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            llm,
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            allow_local_dev_bypass: state.config.allow_local_dev_bypass,
        }
    }
}

impl FromRef<AppState> for Store {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}
