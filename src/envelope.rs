//! The stable JSON response envelope shared by every API endpoint.
//!
//! Every response body has the shape
//! `{ success, data?, error?, meta? }` so clients can branch on `success`
//! without inspecting status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Deserialize a field so that "absent", "null" and "value" stay
/// distinguishable: absent maps to `None` (via `#[serde(default)]`), an
/// explicit null to `Some(None)`, and a value to `Some(Some(value))`.
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// The error body inside a failed envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// One of the stable error codes, e.g. `NOT_FOUND`.
    pub code: &'static str,
    /// A generic, client-safe message. Detailed causes are logged
    /// server-side only.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Cursor pagination metadata on list responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// A 200 envelope around `data`.
pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

/// A 201 envelope around `data`.
pub fn created<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::CREATED, data)
}

/// A 200 envelope around `data` with pagination metadata.
pub fn ok_paginated<T: Serialize>(data: T, pagination: Pagination) -> Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        error: None,
        meta: Some(Meta {
            pagination: Some(pagination),
        }),
    };

    into_response(StatusCode::OK, &body)
}

/// A failure envelope with the given status and stable error code.
pub fn failure(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    let body = Envelope::<Value> {
        success: false,
        data: None,
        error: Some(ApiError {
            code,
            message: message.into(),
            details: None,
        }),
        meta: None,
    };

    into_response(status, &body)
}

fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        error: None,
        meta: None,
    };

    into_response(status, &body)
}

fn into_response<T: Serialize>(status: StatusCode, body: &Envelope<T>) -> Response {
    let mut response = Json(body).into_response();
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod envelope_tests {
    use serde_json::{json, Value};

    use super::{ApiError, Envelope, Meta, Pagination};

    #[test]
    fn success_envelope_omits_error_and_meta() {
        let envelope = Envelope {
            success: true,
            data: Some(json!({"id": "abc"})),
            error: None,
            meta: None,
        };

        let serialized = serde_json::to_value(&envelope).unwrap();

        assert_eq!(serialized, json!({"success": true, "data": {"id": "abc"}}));
    }

    #[test]
    fn failure_envelope_carries_stable_code() {
        let envelope = Envelope::<Value> {
            success: false,
            data: None,
            error: Some(ApiError {
                code: "NOT_FOUND",
                message: "The requested resource could not be found.".to_owned(),
                details: None,
            }),
            meta: None,
        };

        let serialized = serde_json::to_value(&envelope).unwrap();

        assert_eq!(serialized["success"], json!(false));
        assert_eq!(serialized["error"]["code"], json!("NOT_FOUND"));
    }

    #[test]
    fn pagination_meta_uses_camel_case() {
        let envelope = Envelope {
            success: true,
            data: Some(json!([])),
            error: None,
            meta: Some(Meta {
                pagination: Some(Pagination {
                    cursor: Some("abc".to_owned()),
                    has_more: true,
                    total: None,
                }),
            }),
        };

        let serialized = serde_json::to_value(&envelope).unwrap();

        assert_eq!(serialized["meta"]["pagination"]["hasMore"], json!(true));
        assert_eq!(serialized["meta"]["pagination"]["cursor"], json!("abc"));
    }
}
