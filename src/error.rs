//! Defines the app level error type and its mapping onto the stable
//! HTTP error codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::envelope;

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource was not found.
    ///
    /// Also returned for cross-owner lookups so that existence is never
    /// leaked to another owner.
    #[error("the requested resource could not be found")]
    NotFound,

    /// The account referenced by an import or transaction does not exist
    /// for the requesting owner.
    #[error("the account could not be found")]
    AccountNotFound,

    /// The request carried no authenticated owner.
    #[error("missing authentication context")]
    Unauthorized,

    /// The operation conflicts with existing state, e.g. a duplicate
    /// transaction key or a split applied twice.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A field or payload failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request body could not be interpreted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A query parameter held an unusable value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A pagination cursor failed to decode.
    #[error("the pagination cursor could not be decoded")]
    InvalidCursor,

    /// An uploaded document exceeded the size gate.
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },

    /// The uploaded document kind is not one the pipeline ingests.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// The MIME type did not map onto a known document kind.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// An import failed; the Import record carries the operator detail.
    #[error("import failed: {0}")]
    ImportFailed(String),

    /// A document yielded zero transactions.
    #[error("no transactions could be extracted: {0}")]
    ParseFailure(String),

    /// The classifier could not be reached. Never surfaced to clients;
    /// the orchestrator degrades to rule results.
    #[error("classifier unavailable: {0}")]
    LlmUnavailable(String),

    /// The store rejected the operation transiently. Retryable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A query needs an index that does not exist. Requires operator
    /// action, so it is kept distinct from generic unavailability.
    #[error("missing index: {0}")]
    IndexMissing(String),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            // Code 2067 occurs when a UNIQUE constraint failed.
            rusqlite::Error::SqliteFailure(sql_error, Some(ref desc))
                if sql_error.extended_code == 2067 =>
            {
                Error::Conflict(desc.clone())
            }
            rusqlite::Error::SqliteFailure(sql_error, Some(ref desc))
                if desc.contains("no such index") || desc.contains("no such table") =>
            {
                tracing::error!("store schema incomplete ({}): {desc}", sql_error.extended_code);
                Error::IndexMissing(desc.clone())
            }
            rusqlite::Error::SqliteFailure(sql_error, desc)
                if matches!(
                    sql_error.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Error::StoreUnavailable(desc.unwrap_or_else(|| "database busy".to_owned()))
            }
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}

impl Error {
    /// The stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => "NOT_FOUND",
            Error::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::Conflict(_) | Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::InvalidParameter(_) | Error::InvalidCursor => "INVALID_PARAMETER",
            Error::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Error::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            Error::UnsupportedContentType(_) => "UNSUPPORTED_CONTENT_TYPE",
            Error::ImportFailed(_) | Error::ParseFailure(_) => "IMPORT_FAILED",
            Error::LlmUnavailable(_)
            | Error::StoreUnavailable(_)
            | Error::IndexMissing(_)
            | Error::SqlError(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound | Error::AccountNotFound => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation(_)
            | Error::InvalidRequest(_)
            | Error::InvalidParameter(_)
            | Error::InvalidCursor => StatusCode::BAD_REQUEST,
            Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedFileType(_) | Error::UnsupportedContentType(_) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Error::ImportFailed(_) | Error::ParseFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::LlmUnavailable(_)
            | Error::StoreUnavailable(_)
            | Error::IndexMissing(_)
            | Error::SqlError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The client-safe message. Validation-class errors explain what to
    /// fix; everything else stays generic and the cause is logged.
    fn client_message(&self) -> String {
        match self {
            Error::NotFound => "The requested resource could not be found.".to_owned(),
            Error::AccountNotFound => "The account could not be found.".to_owned(),
            Error::Unauthorized => "Authentication is required.".to_owned(),
            Error::Conflict(message) => message.clone(),
            Error::Validation(message) => message.clone(),
            Error::InvalidRequest(message) => message.clone(),
            Error::InvalidParameter(message) => message.clone(),
            Error::InvalidCursor => "The pagination cursor is not valid.".to_owned(),
            Error::FileTooLarge { limit, .. } => {
                format!("The uploaded file exceeds the {limit} byte limit.")
            }
            Error::UnsupportedFileType(kind) => {
                format!("Files of type '{kind}' cannot be imported.")
            }
            Error::UnsupportedContentType(mime) => {
                format!("Content type '{mime}' cannot be imported.")
            }
            Error::ImportFailed(_) | Error::ParseFailure(_) => {
                "No transactions could be extracted from the uploaded file.".to_owned()
            }
            Error::LlmUnavailable(_)
            | Error::StoreUnavailable(_)
            | Error::IndexMissing(_)
            | Error::SqlError(_) => "An unexpected error occurred. Please try again.".to_owned(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!("request failed: {self}");
        }

        envelope::failure(self.status(), self.code(), self.client_message())
    }
}

#[cfg(test)]
mod error_tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::Error;

    #[test]
    fn no_rows_maps_to_not_found() {
        let error = Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(error, Error::NotFound));
    }

    #[test]
    fn stable_codes() {
        assert_eq!(Error::NotFound.code(), "NOT_FOUND");
        assert_eq!(Error::AccountNotFound.code(), "ACCOUNT_NOT_FOUND");
        assert_eq!(Error::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(Error::InvalidCursor.code(), "INVALID_PARAMETER");
        assert_eq!(
            Error::FileTooLarge { size: 11, limit: 10 }.code(),
            "FILE_TOO_LARGE"
        );
        assert_eq!(
            Error::UnsupportedContentType("text/html".to_owned()).code(),
            "UNSUPPORTED_CONTENT_TYPE"
        );
        assert_eq!(
            Error::StoreUnavailable("busy".to_owned()).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let response = Error::SqlError(rusqlite::Error::InvalidQuery).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let response = Error::Validation("notes too long".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
