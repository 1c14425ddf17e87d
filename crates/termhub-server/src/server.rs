//! Core server: accepts WebSocket connections and routes them by path.
//!
//! `/sessions` is the JSON control channel; `/sessions/<id>` attaches a live
//! stream to one session. Owns the session manager and the port allocator.

use crate::config::ServerConfig;
use crate::ports::PortAllocator;
use crate::session::{CreateOptions, SessionManager, StreamEvent};
use crate::transport::websocket::{self, WebSocketConnection};
use std::sync::Arc;
use termhub_core::messages::{CLOSE_NORMAL, CLOSE_UNKNOWN_SESSION};
use termhub_core::{
    decode, encode, ClientMessage, ControlRequest, ControlResponse, TermError, TermResult,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const CONTROL_PATH: &str = "/sessions";

/// The termhub server instance.
pub struct TermServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    ports: Arc<PortAllocator>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TermServer {
    /// Create a server, probing the host for tmux once.
    pub async fn new(config: ServerConfig) -> Self {
        let manager = Arc::new(SessionManager::detect(config.sessions.clone()).await);
        let ports = Arc::new(PortAllocator::new(
            &config.port_registry,
            config.port_start,
            config.port_end,
        ));
        Self::with_parts(config, manager, ports)
    }

    pub fn with_parts(
        config: ServerConfig,
        manager: Arc<SessionManager>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            manager,
            ports,
            shutdown_tx,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Bind the configured address and serve until the listener closes.
    pub async fn run(self: Arc<Self>) -> TermResult<()> {
        let (addr, conns) = websocket::start_listener(self.config.listen).await?;
        info!(
            %addr,
            persistence = self.manager.is_persistence_available(),
            registry = %self.config.port_registry.display(),
            "termhub ready"
        );
        self.serve(conns).await;
        Ok(())
    }

    /// Handle connections from an already-started listener.
    pub async fn serve(self: Arc<Self>, mut conns: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = conns.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }
        info!("listener closed");
    }

    /// Notify control connections, then detach persistent sessions and
    /// close the rest.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.manager.shutdown().await;
        info!("all sessions released");
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> TermResult<()> {
        let remote = conn.remote_addr;
        let path = conn.path.trim_end_matches('/').to_string();
        debug!(remote = %remote, %path, "routing WebSocket connection");

        if path == CONTROL_PATH {
            return self.control_loop(&mut conn).await;
        }
        match path.strip_prefix("/sessions/") {
            Some(id) if !id.is_empty() && !id.contains('/') => {
                self.stream_loop(&mut conn, id).await
            }
            _ => {
                websocket::ws_close(&mut conn.ws_stream, CLOSE_UNKNOWN_SESSION, "unknown path")
                    .await;
                Ok(())
            }
        }
    }

    async fn control_loop(&self, conn: &mut WebSocketConnection) -> TermResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received, closing control channel");
                    websocket::ws_close(&mut conn.ws_stream, CLOSE_NORMAL, "server shutdown").await;
                    break;
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(text)) => {
                            let response = match decode::<ControlRequest>(&text) {
                                Ok(request) => self.dispatch(request).await,
                                Err(e) => ControlResponse::failed(e.to_string()),
                            };
                            websocket::ws_send_text(&mut conn.ws_stream, encode(&response)?).await?;
                        }
                        Ok(None) => {
                            debug!("control channel closed by peer");
                            break;
                        }
                        Err(e) => {
                            debug!(error = %e, "control channel ended");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn stream_loop(&self, conn: &mut WebSocketConnection, id: &str) -> TermResult<()> {
        let Some(mut attachment) = self.manager.attach_stream(id).await else {
            debug!(session_id = id, "stream attach for unknown session");
            websocket::ws_close(&mut conn.ws_stream, CLOSE_UNKNOWN_SESSION, "session not found")
                .await;
            return Ok(());
        };
        let stream_id = attachment.stream_id;

        let result = loop {
            tokio::select! {
                event = attachment.recv() => {
                    match event {
                        Some(StreamEvent::Message(msg)) => {
                            let text = encode(&msg)?;
                            if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, text).await {
                                break Err(e);
                            }
                        }
                        Some(StreamEvent::Close { code, reason }) => {
                            websocket::ws_close(&mut conn.ws_stream, code, &reason).await;
                            break Ok(());
                        }
                        None => break Ok(()),
                    }
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(text)) => match decode::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if let Some(reply) = self.manager.handle_stream_message(id, msg).await {
                                    let text = encode(&reply)?;
                                    if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, text).await {
                                        break Err(e);
                                    }
                                }
                            }
                            Err(e) => debug!(session_id = id, error = %e, "ignoring malformed stream message"),
                        },
                        Ok(None) => break Ok(()),
                        Err(e) => {
                            debug!(session_id = id, error = %e, "stream ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.manager.release_stream(id, stream_id).await;
        debug!(session_id = id, stream_id, "stream loop finished");
        result
    }

    async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let manager = &self.manager;
        match request {
            ControlRequest::Create {
                cwd,
                name,
                command,
                args,
                env,
                persist,
            } => {
                let opts = CreateOptions {
                    cwd,
                    name,
                    command,
                    args,
                    env,
                    persist,
                };
                match manager.create(opts).await {
                    Ok(session) => ControlResponse::Session { session },
                    Err(e) => error_response(&e),
                }
            }
            ControlRequest::Reconnect { name, cwd, env } => {
                match manager.reconnect(&name, &cwd, &env).await {
                    Ok(Some(session)) => ControlResponse::Session { session },
                    Ok(None) => {
                        ControlResponse::not_found(format!("persistent session not found: {name}"))
                    }
                    Err(e) => error_response(&e),
                }
            }
            ControlRequest::List => ControlResponse::Sessions {
                sessions: manager.list().await,
            },
            ControlRequest::Get { id } => match manager.get(&id).await {
                Some(session) => ControlResponse::Session { session },
                None => session_not_found(&id),
            },
            ControlRequest::Rename { id, name } => {
                if manager.rename(&id, name).await {
                    ControlResponse::Ok { success: true }
                } else {
                    session_not_found(&id)
                }
            }
            ControlRequest::Write { id, data } => ControlResponse::Ok {
                success: manager.write(&id, data.as_bytes()).await,
            },
            ControlRequest::Resize { id, cols, rows } => ControlResponse::Ok {
                success: manager.resize(&id, cols, rows).await,
            },
            ControlRequest::Close {
                id,
                kill_persistent,
            } => {
                if manager.close(&id, kill_persistent).await {
                    ControlResponse::Ok { success: true }
                } else {
                    session_not_found(&id)
                }
            }
            ControlRequest::Detach { id } => {
                if manager.detach(&id).await {
                    ControlResponse::Ok { success: true }
                } else {
                    session_not_found(&id)
                }
            }
            ControlRequest::Recent { id, max_lines } => {
                match manager.recent_output(&id, max_lines).await {
                    Ok(lines) => ControlResponse::Lines { lines },
                    Err(e) => error_response(&e),
                }
            }
            ControlRequest::PersistentList => ControlResponse::Persistent {
                sessions: manager.list_persistent_sessions().await,
            },
            ControlRequest::Capabilities => ControlResponse::Capabilities {
                persistence: manager.is_persistence_available(),
            },
            ControlRequest::AllocatePorts { count } => {
                let ports = self.ports.clone();
                match run_blocking(move || ports.allocate(count)).await {
                    Ok(ports) => ControlResponse::Ports { ports },
                    Err(e) => error_response(&e),
                }
            }
            ControlRequest::ReleasePorts { ports: released } => {
                let ports = self.ports.clone();
                match run_blocking(move || ports.release(&released)).await {
                    Ok(()) => ControlResponse::Ok { success: true },
                    Err(e) => error_response(&e),
                }
            }
        }
    }
}

/// Run blocking registry I/O off the async workers.
async fn run_blocking<T, F>(f: F) -> TermResult<T>
where
    F: FnOnce() -> TermResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TermError::Other(format!("blocking task failed: {e}")))?
}

fn session_not_found(id: &str) -> ControlResponse {
    ControlResponse::not_found(TermError::SessionNotFound(id.to_string()).to_string())
}

fn error_response(e: &TermError) -> ControlResponse {
    if e.is_not_found() {
        ControlResponse::not_found(e.to_string())
    } else {
        ControlResponse::failed(e.to_string())
    }
}
