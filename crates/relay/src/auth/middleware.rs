// Access-token authentication shared by the REST routes and the presence
// upgrade. REST callers must use `Authorization: Bearer`; the upgrade also
// accepts a `token` query parameter since browsers cannot set headers there.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{
    auth::jwt::{AccessTokenError, AuthenticatedUser, JwtAccessTokenService},
    error::{ErrorCode, RelayError},
};

/// Verifies `token`, mapping every failure to `AUTH_INVALID_TOKEN`.
pub fn authenticate(
    jwt_service: &JwtAccessTokenService,
    token: Option<&str>,
) -> Result<AuthenticatedUser, RelayError> {
    let token =
        token.ok_or_else(|| RelayError::new(ErrorCode::AuthInvalidToken, "missing access token"))?;

    jwt_service.validate_organisation_token(token).map_err(|error| {
        debug!(reason = error.reason(), error = %error, "access token rejected");
        let message = match error {
            AccessTokenError::Expired => "access token has expired",
            _ => "invalid access token",
        };
        RelayError::new(ErrorCode::AuthInvalidToken, message)
    })
}

/// Route layer that stores the [`AuthenticatedUser`] in request extensions.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&jwt_service, bearer_token(request.headers())) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(char::is_whitespace)?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
