use super::protocol as ws_protocol;
use super::{PresenceRouterState, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS};
use crate::auth::{
    jwt::AuthenticatedUser,
    middleware::{authenticate, bearer_token},
};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::hub::{registry::ConnectionHandle, rooms::RoomError};
use crate::metrics;
use crate::validation::{check_ws_frame_size, MAX_WS_FRAME_BYTES};
use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use callboard_common::{
    protocol::{validation::decode_client_message, ws::ClientMessage},
    types::{OrganisationId, RoomErrorCode},
};
use std::{collections::HashMap, time::Duration};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub async fn ws_upgrade(
    State(state): State<PresenceRouterState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let access = match admit(&state, &params, &headers).await {
        Ok(access) => access,
        Err(error) => return error.into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_WS_FRAME_BYTES)
        .max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, access, socket)).await;
        })
}

/// Authenticates the caller and checks organisation membership. Runs before
/// the upgrade, so refused callers are never registered.
async fn admit(
    state: &PresenceRouterState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, RelayError> {
    let token = params
        .get("token")
        .map(String::as_str)
        .filter(|token| !token.trim().is_empty())
        .or_else(|| bearer_token(headers));
    let access = authenticate(&state.jwt_service, token)?;

    let organisation_id = params
        .get("organisationId")
        .and_then(|raw| raw.trim().parse::<OrganisationId>().ok())
        .ok_or_else(|| {
            RelayError::new(ErrorCode::ValidationFailed, "organisationId must be an integer")
                .with_details(serde_json::json!({ "field": "organisationId" }))
        })?;

    if access.organisation_id != organisation_id {
        return Err(RelayError::new(
            ErrorCode::AuthForbidden,
            "token is scoped to a different organisation",
        ));
    }

    match state.membership.is_active_member(organisation_id, access.user_id).await {
        Ok(true) => Ok(access),
        Ok(false) => Err(RelayError::new(
            ErrorCode::AuthForbidden,
            "caller is not an active member of this organisation",
        )),
        Err(error) => {
            error!(
                error = ?error,
                organisation_id,
                user_id = access.user_id,
                "failed to evaluate organisation membership"
            );
            Err(RelayError::from_code(ErrorCode::InternalError))
        }
    }
}

async fn handle_socket(state: PresenceRouterState, access: AuthenticatedUser, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (outbound_sender, mut outbound_receiver) = state.hub.outbound_channel();
    let handle =
        state.hub.register(access.organisation_id, access.user_id, outbound_sender).await;
    metrics::connection_opened();
    info!(
        organisation_id = handle.organisation_id,
        user_id = handle.user_id,
        connection_id = %handle.connection_id,
        request_id = %request_id,
        "presence socket opened"
    );

    // Ping every interval; a ping left unanswered past the timeout drops the socket.
    let heartbeat_period = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut heartbeat_interval = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    let mut ping_outstanding_since: Option<Instant> = None;

    loop {
        let ping_deadline = ping_outstanding_since.map(|sent_at| sent_at + heartbeat_timeout);
        tokio::select! {
            _ = ping_expiry(ping_deadline) => {
                warn!(
                    organisation_id = handle.organisation_id,
                    user_id = handle.user_id,
                    connection_id = %handle.connection_id,
                    "heartbeat timeout, disconnecting"
                );
                break;
            }
            _ = heartbeat_interval.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                ping_outstanding_since.get_or_insert_with(Instant::now);
            }
            maybe_outbound = outbound_receiver.recv() => {
                // `None` means the hub evicted this connection.
                let Some(outbound_message) = maybe_outbound else {
                    break;
                };
                if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        if is_oversized(&error) {
                            ws_protocol::close_frame_too_large(
                                &mut socket,
                                ws_protocol::frame_size_exceeded_reason(),
                            )
                            .await;
                        } else {
                            debug!(error = %error, connection_id = %handle.connection_id, "websocket read failed");
                        }
                        break;
                    }
                };
                ping_outstanding_since = None;

                match message {
                    Message::Text(raw_message) => {
                        if let Err(reason) = check_ws_frame_size(raw_message.len()) {
                            metrics::record_ws_message("oversized", true);
                            ws_protocol::close_frame_too_large(&mut socket, reason).await;
                            break;
                        }
                        if handle_text_frame(&state, &handle, raw_message.as_str(), &mut socket)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Binary(payload) => {
                        if let Err(reason) = check_ws_frame_size(payload.len()) {
                            metrics::record_ws_message("oversized", true);
                            ws_protocol::close_frame_too_large(&mut socket, reason).await;
                            break;
                        }
                        metrics::record_ws_message("binary", true);
                        if ws_protocol::send_room_error(
                            &mut socket,
                            RoomErrorCode::SignalInvalid,
                            "binary frames are not supported",
                        )
                        .await
                        .is_err()
                        {
                            break;
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    state.hub.unregister(&handle).await;
    metrics::connection_closed();
    info!(
        organisation_id = handle.organisation_id,
        user_id = handle.user_id,
        connection_id = %handle.connection_id,
        "presence socket closed"
    );
}

/// Resolves at `deadline`; never resolves without one.
pub(super) async fn ping_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_oversized(error: &axum::Error) -> bool {
    ws_protocol::is_frame_size_violation(error)
}

/// Decodes and dispatches one client frame. Failures go back to the sender
/// as `room-error`; only a failed socket write is returned as an error.
async fn handle_text_frame(
    state: &PresenceRouterState,
    handle: &ConnectionHandle,
    raw_message: &str,
    socket: &mut axum::extract::ws::WebSocket,
) -> Result<(), axum::Error> {
    let message = match decode_client_message(raw_message) {
        Ok(message) => message,
        Err(error) => {
            metrics::record_ws_message("invalid", true);
            debug!(
                error = %error,
                connection_id = %handle.connection_id,
                "rejected client frame"
            );
            return ws_protocol::send_room_error(socket, RoomErrorCode::SignalInvalid, error.to_string())
                .await;
        }
    };

    let kind = message.kind();
    let result = dispatch(state, handle, message).await;
    metrics::record_ws_message(kind, result.is_err());

    match result {
        Ok(()) => Ok(()),
        Err(error) => {
            debug!(
                error = %error,
                code = error.code().as_str(),
                kind,
                organisation_id = handle.organisation_id,
                user_id = handle.user_id,
                "room operation refused"
            );
            ws_protocol::send_room_error(socket, error.code(), error.to_string()).await
        }
    }
}

async fn dispatch(
    state: &PresenceRouterState,
    handle: &ConnectionHandle,
    message: ClientMessage,
) -> Result<(), RoomError> {
    match message {
        ClientMessage::JoinRoom { room_user_id } => {
            let permitted = match state
                .membership
                .is_active_member(handle.organisation_id, handle.user_id)
                .await
            {
                Ok(permitted) => permitted,
                Err(error) => {
                    error!(
                        error = ?error,
                        organisation_id = handle.organisation_id,
                        user_id = handle.user_id,
                        "membership lookup failed during join"
                    );
                    false
                }
            };
            state.hub.join_room(handle, room_user_id, permitted).await
        }
        ClientMessage::LeaveRoom {} => {
            state.hub.leave_room(handle).await;
            Ok(())
        }
        ClientMessage::EndRoom {} => state.hub.end_room(handle).await,
        signal => state.hub.relay_signal(handle, signal).await,
    }
}
