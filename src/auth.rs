//! Extracts the authenticated owner from edge-supplied headers.
//!
//! Token verification happens at the HTTP edge; this service trusts the
//! `x-user-id` header it receives from the gateway and treats the value as
//! the authoritative owner id. A cross-owner lookup downstream reads as
//! "not found", never "forbidden".

use axum::{extract::FromRef, extract::FromRequestParts, http::request::Parts};

use crate::Error;

/// Header carrying the authenticated user id, injected by the edge.
pub const OWNER_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user email, when the edge knows it.
pub const EMAIL_HEADER: &str = "x-user-email";

/// The owner used when the local development bypass is active.
pub const LOCAL_DEV_OWNER: &str = "local-dev";

/// The authenticated principal of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Opaque owner id; every record the request touches is scoped to it.
    pub owner_id: String,
    pub email: Option<String>,
}

/// The state needed to resolve the auth context.
#[derive(Debug, Clone)]
pub struct AuthState {
    /// Substitute [LOCAL_DEV_OWNER] when the auth headers are absent.
    /// Must be false in production.
    pub allow_local_dev_bypass: bool,
}

impl<S> FromRequestParts<S> for AuthContext
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_state = AuthState::from_ref(state);

        let owner_id = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let email = parts
            .headers
            .get(EMAIL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        match owner_id {
            Some(owner_id) => Ok(AuthContext {
                owner_id: owner_id.to_owned(),
                email,
            }),
            None if auth_state.allow_local_dev_bypass => {
                tracing::debug!("auth headers absent, using local dev owner");
                Ok(AuthContext {
                    owner_id: LOCAL_DEV_OWNER.to_owned(),
                    email: None,
                })
            }
            None => Err(Error::Unauthorized),
        }
    }
}
