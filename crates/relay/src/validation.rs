// Input validation at the HTTP and WebSocket boundary.
//
// REST bodies go through `ValidatedJson`; presence frames are size-checked
// here before they are decoded.
//
// Per-message payload caps (SDP, ICE candidates) live in
// `callboard_common::protocol::validation`.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

/// Maximum WebSocket frame payload in bytes (256 KiB).
pub const MAX_WS_FRAME_BYTES: usize = 256 * 1024;

/// Maximum REST request body in bytes (1 MiB).
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

/// JSON body extractor whose rejections use the relay error envelope, with
/// `details.kind` naming what went wrong.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = RelayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| ValidatedJson(value))
            .map_err(|rejection| rejection_error(&rejection))
    }
}

fn rejection_error(rejection: &JsonRejection) -> RelayError {
    let (code, kind, message) = match rejection {
        JsonRejection::JsonDataError(error) => {
            (ErrorCode::ValidationFailed, "data_error", format!("invalid JSON payload: {error}"))
        }
        JsonRejection::JsonSyntaxError(error) => {
            (ErrorCode::ValidationFailed, "syntax_error", format!("malformed JSON: {error}"))
        }
        JsonRejection::MissingJsonContentType(_) => (
            ErrorCode::ValidationFailed,
            "missing_content_type",
            "expected Content-Type: application/json".to_owned(),
        ),
        JsonRejection::BytesRejection(error) if error.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return RelayError::new(ErrorCode::PayloadTooLarge, format!("request body error: {error}"))
                .with_details(json!({ "kind": "body_too_large", "max_bytes": MAX_REST_BODY_BYTES }));
        }
        other => (ErrorCode::ValidationFailed, "body_error", format!("request body error: {other}")),
    };
    RelayError::new(code, message).with_details(json!({ "kind": kind }))
}

/// Check a WebSocket frame against the size limit.
/// Returns a message suitable for a close frame reason.
pub fn check_ws_frame_size(len: usize) -> Result<(), String> {
    if len > MAX_WS_FRAME_BYTES {
        Err(format!("frame size {len} bytes exceeds limit of {MAX_WS_FRAME_BYTES} bytes"))
    } else {
        Ok(())
    }
}
