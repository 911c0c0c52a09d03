//! Environment-based configuration for the service.
//!
//! The configuration surface is a closed set: every variable the service
//! reads is listed here with its default. Values are parsed once at start
//! up; an invalid value fails fast rather than being silently coerced.

use std::env;

use crate::Error;

/// Default port the HTTP server listens on.
pub const DEFAULT_PORT: u16 = 8080;
/// Default region for the store and model provider.
pub const DEFAULT_REGION: &str = "northamerica-northeast1";
/// Default Anthropic-compatible model used by the `claude_like` provider.
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";
/// Default Vertex model used by the `vertex_like` provider.
pub const DEFAULT_VERTEX_MODEL: &str = "gemini-1.5-flash";
/// Default path of the embedded store file.
pub const DEFAULT_DATABASE_PATH: &str = "ledgerline.db";

/// Which large-language-model provider strategy the adapter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// An Anthropic Messages API compatible endpoint.
    ClaudeLike,
    /// A Vertex `generateContent` compatible endpoint.
    VertexLike,
}

impl LlmProvider {
    /// Parse a provider name as it appears in `LLM_PROVIDER`.
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "claude_like" => Ok(Self::ClaudeLike),
            "vertex_like" => Ok(Self::VertexLike),
            other => Err(Error::Validation(format!(
                "LLM_PROVIDER must be one of 'claude_like' or 'vertex_like', got '{other}'"
            ))),
        }
    }
}

/// The full runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project namespace for the store and model provider. Required.
    pub project_id: String,
    /// Region for the store and model provider.
    pub region: String,
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Which provider strategy the LLM adapter uses.
    pub llm_provider: LlmProvider,
    /// Model name for the `claude_like` provider.
    pub anthropic_model: String,
    /// API key for the `claude_like` provider, if configured.
    pub anthropic_api_key: Option<String>,
    /// Model name for the `vertex_like` provider.
    pub vertex_model: String,
    /// Location for the `vertex_like` provider.
    pub vertex_location: String,
    /// Access token for the `vertex_like` provider, if configured.
    /// Token minting belongs to the deployment environment.
    pub vertex_access_token: Option<String>,
    /// Whether the LLM classification fallback is enabled at all.
    pub llm_categorization_enabled: bool,
    /// If set, the single origin allowed by the CORS layer.
    pub cors_allowed_origin: Option<String>,
    /// Substitute a fixed local owner when the auth headers are absent.
    /// Must be false in production.
    pub allow_local_dev_bypass: bool,
    /// Path of the embedded store file. `:memory:` is accepted.
    pub database_path: String,
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    /// Returns [Error::Validation] if `GCP_PROJECT_ID` is missing or any
    /// variable holds a value outside its closed set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which plays the role of
    /// `env::var`. Split out so tests can drive the parser without touching
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let project_id = lookup("GCP_PROJECT_ID")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| Error::Validation("GCP_PROJECT_ID must be set".to_owned()))?;

        let region = lookup("GCP_REGION").unwrap_or_else(|| DEFAULT_REGION.to_owned());

        let port = match lookup("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|error| {
                Error::Validation(format!("PORT must be a valid port number: {error}"))
            })?,
            None => DEFAULT_PORT,
        };

        let llm_provider = match lookup("LLM_PROVIDER") {
            Some(raw) => LlmProvider::parse(&raw)?,
            None => LlmProvider::VertexLike,
        };

        let vertex_location = lookup("VERTEX_LOCATION").unwrap_or_else(|| region.clone());

        Ok(Config {
            project_id,
            region,
            port,
            llm_provider,
            anthropic_model: lookup("ANTHROPIC_MODEL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_owned()),
            anthropic_api_key: lookup("ANTHROPIC_API_KEY"),
            vertex_model: lookup("VERTEX_MODEL").unwrap_or_else(|| DEFAULT_VERTEX_MODEL.to_owned()),
            vertex_location,
            vertex_access_token: lookup("VERTEX_ACCESS_TOKEN"),
            llm_categorization_enabled: parse_bool(
                lookup("LLM_CATEGORIZATION_ENABLED"),
                "LLM_CATEGORIZATION_ENABLED",
                true,
            )?,
            cors_allowed_origin: lookup("CORS_ALLOWED_ORIGIN"),
            allow_local_dev_bypass: parse_bool(
                lookup("ALLOW_LOCAL_DEV_BYPASS"),
                "ALLOW_LOCAL_DEV_BYPASS",
                false,
            )?,
            database_path: lookup("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_owned()),
        })
    }
}

fn parse_bool(value: Option<String>, name: &str, default: bool) -> Result<bool, Error> {
    match value.as_deref() {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(Error::Validation(format!(
            "{name} must be 'true' or 'false', got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod config_tests {
    use std::collections::HashMap;

    use super::{Config, LlmProvider, DEFAULT_PORT, DEFAULT_REGION};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_applied() {
        let config =
            Config::from_lookup(lookup_from(&[("GCP_PROJECT_ID", "test-project")])).unwrap();

        assert_eq!(config.project_id, "test-project");
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.llm_provider, LlmProvider::VertexLike);
        assert!(config.llm_categorization_enabled);
        assert!(!config.allow_local_dev_bypass);
        assert_eq!(config.vertex_location, DEFAULT_REGION);
    }

    #[test]
    fn missing_project_id_is_rejected() {
        assert!(Config::from_lookup(lookup_from(&[])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("GCP_PROJECT_ID", "  ")])).is_err());
    }

    #[test]
    fn provider_is_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("GCP_PROJECT_ID", "p"),
            ("LLM_PROVIDER", "claude_like"),
        ]))
        .unwrap();
        assert_eq!(config.llm_provider, LlmProvider::ClaudeLike);

        let bad = Config::from_lookup(lookup_from(&[
            ("GCP_PROJECT_ID", "p"),
            ("LLM_PROVIDER", "gpt_like"),
        ]));
        assert!(bad.is_err());
    }

    #[test]
    fn vertex_location_falls_back_to_region() {
        let config = Config::from_lookup(lookup_from(&[
            ("GCP_PROJECT_ID", "p"),
            ("GCP_REGION", "europe-west1"),
        ]))
        .unwrap();
        assert_eq!(config.vertex_location, "europe-west1");

        let config = Config::from_lookup(lookup_from(&[
            ("GCP_PROJECT_ID", "p"),
            ("VERTEX_LOCATION", "us-central1"),
        ]))
        .unwrap();
        assert_eq!(config.vertex_location, "us-central1");
    }

    #[test]
    fn invalid_booleans_are_rejected() {
        let bad = Config::from_lookup(lookup_from(&[
            ("GCP_PROJECT_ID", "p"),
            ("LLM_CATEGORIZATION_ENABLED", "yes"),
        ]));
        assert!(bad.is_err());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let bad = Config::from_lookup(lookup_from(&[("GCP_PROJECT_ID", "p"), ("PORT", "eight")]));
        assert!(bad.is_err());
    }
}
