// Blocking WebSocket transport for the presence channel.

use std::net::TcpStream;

use anyhow::{anyhow, Context, Result};
use callboard_common::protocol::ws::{ClientMessage, ServerMessage};
use tokio_tungstenite::tungstenite::{
    self, protocol::WebSocket, stream::MaybeTlsStream, Message,
};
use tracing::{debug, warn};
use url::Url;

use crate::presence::PresenceTransport;

/// [`PresenceTransport`] over a blocking tungstenite socket. Pings are
/// answered by tungstenite while reading.
#[derive(Default)]
pub struct TungsteniteTransport {
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(&mut self) -> Result<&mut WebSocket<MaybeTlsStream<TcpStream>>> {
        self.socket.as_mut().ok_or_else(|| anyhow!("presence socket is not open"))
    }
}

impl PresenceTransport for TungsteniteTransport {
    fn connect(&mut self, url: &Url) -> Result<()> {
        self.close();
        let host = url.host_str().unwrap_or("relay");
        let (socket, response) = tungstenite::connect(url.as_str())
            .with_context(|| format!("failed to open presence socket to {host}"))?;
        debug!(status = response.status().as_u16(), "presence socket upgraded");
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let encoded = serde_json::to_string(message).context("failed to encode client frame")?;
        self.socket()?
            .send(Message::Text(encoded.into()))
            .with_context(|| format!("failed to send {}", message.kind()))
    }

    fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let frame = match self.socket()?.read() {
                Ok(frame) => frame,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.socket = None;
                    return Ok(None);
                }
                Err(error) => return Err(error).context("failed to read presence frame"),
            };

            match frame {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    // Unknown frame types are skipped.
                    Err(error) => warn!(error = %error, "ignoring undecodable presence frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "presence socket closed by relay");
                }
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(error) = socket.close(None) {
                debug!(error = %error, "presence socket close failed");
            }
        }
    }
}
