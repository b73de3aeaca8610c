// HTTP error envelope and per-request id plumbing.
//
// Every refusal the relay sends over HTTP, including a refused presence
// upgrade, has the shape
// `{"error":{"code","message","retryable","request_id","details"}}`.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    PayloadTooLarge,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only server-side failures are worth retrying unchanged.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }

    const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid access token",
            Self::AuthForbidden => "caller is not allowed to do this",
            Self::NotFound => "no such route",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
    request_id: Option<String>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: ErrorCode,
    message: &'a str,
    retryable: bool,
    request_id: Option<&'a str>,
    details: &'a Value,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None, request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Pins the id instead of reading it from the task-local scope.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.clone().or_else(current_request_id);
        let empty = Value::Object(Default::default());
        let envelope = Envelope {
            error: EnvelopeBody {
                code: self.code,
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
                details: self.details.as_ref().unwrap_or(&empty),
            },
        };

        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = &request_id {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

/// Runs `future` with `request_id` visible to [`current_request_id`].
pub async fn with_request_id_scope<F: Future>(request_id: String, future: F) -> F::Output {
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(String::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.trim().is_empty() => value.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::to_bytes,
        http::{HeaderMap, HeaderValue, StatusCode},
        response::IntoResponse,
    };
    use serde_json::{json, Value};

    use super::*;

    async fn envelope(error: RelayError) -> (StatusCode, HeaderMap, Value) {
        let response = error.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("readable body");
        (status, headers, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn envelope_picks_up_scoped_request_id() {
        let (status, headers, body) = with_request_id_scope("req-scoped-123".to_owned(), async {
            envelope(RelayError::from_code(ErrorCode::InternalError)).await
        })
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(headers[REQUEST_ID_HEADER], "req-scoped-123");
        assert_eq!(
            body,
            json!({
                "error": {
                    "code": "INTERNAL_ERROR",
                    "message": "internal server error",
                    "retryable": true,
                    "request_id": "req-scoped-123",
                    "details": {},
                }
            })
        );
    }

    #[tokio::test]
    async fn envelope_without_scope_has_null_request_id() {
        let (_, headers, body) = envelope(RelayError::from_code(ErrorCode::NotFound)).await;
        assert!(body["error"]["request_id"].is_null());
        assert!(!headers.contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn admission_codes_map_to_expected_statuses() {
        for (code, status) in [
            (ErrorCode::ValidationFailed, StatusCode::BAD_REQUEST),
            (ErrorCode::AuthInvalidToken, StatusCode::UNAUTHORIZED),
            (ErrorCode::AuthForbidden, StatusCode::FORBIDDEN),
            (ErrorCode::PayloadTooLarge, StatusCode::PAYLOAD_TOO_LARGE),
        ] {
            let (actual, _, body) = envelope(RelayError::from_code(code)).await;
            assert_eq!(actual, status);
            assert_eq!(body["error"]["code"], code.as_str());
            assert_eq!(body["error"]["retryable"], false);
        }
    }

    #[tokio::test]
    async fn details_and_pinned_request_id_are_kept() {
        let (_, _, body) = with_request_id_scope("req-scoped-123".to_owned(), async {
            envelope(
                RelayError::new(ErrorCode::ValidationFailed, "bad payload")
                    .with_details(json!({ "field": "organisationId" }))
                    .with_request_id("req-pinned-456"),
            )
            .await
        })
        .await;
        assert_eq!(body["error"]["details"]["field"], "organisationId");
        assert_eq!(body["error"]["request_id"], "req-pinned-456");
        assert_eq!(body["error"]["message"], "bad payload");
    }

    #[test]
    fn display_names_code_and_message() {
        let error = RelayError::new(ErrorCode::AuthForbidden, "wrong organisation");
        assert_eq!(error.to_string(), "AUTH_FORBIDDEN: wrong organisation");
    }

    #[test]
    fn request_id_is_propagated_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-from-client"));
        assert_eq!(request_id_from_headers_or_generate(&headers), "req-from-client");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  "));
        let generated = request_id_from_headers_or_generate(&headers);
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
