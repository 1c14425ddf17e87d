//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, completes the upgrade handshake, and yields each
//! connection together with the request path it asked for. Routing on the
//! path is left to the server.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termhub_core::{TermError, TermResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Maximum accepted text frame (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    /// Request path from the upgrade, e.g. `/sessions/abc`.
    pub path: String,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> TermResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| TermError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut path = String::new();
                        let capture =
                            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                                path = req.uri().path().to_string();
                                Ok(resp)
                            };
                        match tokio_tungstenite::accept_hdr_async(stream, capture).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, %path, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    path,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one JSON text frame.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> TermResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` once the peer closes. Binary frames are read as UTF-8;
/// pings are answered.
pub async fn ws_recv_text(ws: &mut WsStream) -> TermResult<Option<String>> {
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TermError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        };
        if text.len() > MAX_WS_FRAME_SIZE {
            return Err(TermError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {})",
                text.len(),
                MAX_WS_FRAME_SIZE
            )));
        }
        return Ok(Some(text));
    }
}

/// Close with an application close code. Errors are ignored: the peer may
/// already be gone.
pub async fn ws_close(ws: &mut WsStream, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(code, error = %e, "WS close failed");
    }
}
