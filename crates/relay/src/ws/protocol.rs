use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use callboard_common::{protocol::ws::ServerMessage, types::RoomErrorCode};

use crate::validation::MAX_WS_FRAME_BYTES;

pub async fn send_ws_message(
    socket: &mut WebSocket,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let encoded = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(encoded.into())).await
}

pub async fn send_room_error(
    socket: &mut WebSocket,
    code: RoomErrorCode,
    message: impl Into<String>,
) -> Result<(), axum::Error> {
    send_ws_message(socket, &ServerMessage::room_error(code, message)).await
}

pub async fn close_frame_too_large(socket: &mut WebSocket, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code: close_code::SIZE, reason: reason.into() })))
        .await;
}

pub fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_WS_FRAME_BYTES} bytes")
}

/// The socket reports an oversized frame as a generic read error.
pub fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
