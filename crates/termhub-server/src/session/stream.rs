//! Live stream attachment and the per-session output pump.
//!
//! At most one stream consumer is attached to a session. A newer attachment
//! displaces the older one, which is closed with [`CLOSE_REPLACED`]. The pump
//! is the only reader of the PTY: it feeds the preview buffer, the attached
//! stream and the recorder, and unregisters the session when the process exits.

use super::manager::{SessionManager, SessionMap};
use super::pty::{PtyHandle, Utf8Decoder};
use super::recording::RecordingEvent;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use termhub_core::messages::{CLOSE_NORMAL, CLOSE_REPLACED};
use termhub_core::{ClientMessage, ServerMessage, SessionStatus};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Messages buffered per stream before a slow consumer starts applying backpressure.
const STREAM_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8192;

/// What a transport should do next for its attached stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Message(ServerMessage),
    /// Close the transport with this code; nothing follows.
    Close { code: u16, reason: String },
}

/// Terminal notice for a stream. Travels outside the message queue so it
/// never waits behind a consumer that stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CloseNotice {
    /// Delivered just before the close, even if queued output is dropped.
    last: Option<ServerMessage>,
    code: u16,
    reason: String,
}

impl CloseNotice {
    fn into_events(self) -> VecDeque<StreamEvent> {
        self.last
            .map(StreamEvent::Message)
            .into_iter()
            .chain(std::iter::once(StreamEvent::Close {
                code: self.code,
                reason: self.reason,
            }))
            .collect()
    }
}

/// Sending half held by the session while a stream is attached.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: u64,
    tx: mpsc::Sender<ServerMessage>,
    close_tx: Arc<watch::Sender<Option<CloseNotice>>>,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message, waiting for capacity. Gives up (false) once the
    /// stream is closed or the consumer has gone away.
    pub async fn send(&self, msg: ServerMessage) -> bool {
        let mut closed = self.close_tx.subscribe();
        if closed.borrow().is_some() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(msg) => sent.is_ok(),
            _ = wait_closed(&mut closed) => false,
        }
    }

    /// Close the stream. Never blocks; the first close wins.
    pub fn close(&self, code: u16, reason: &str) {
        self.finish(None, code, reason);
    }

    /// Close the stream with a final message delivered ahead of the close.
    pub fn finish(&self, last: Option<ServerMessage>, code: u16, reason: &str) {
        self.close_tx.send_if_modified(|notice| {
            if notice.is_some() {
                return false;
            }
            *notice = Some(CloseNotice {
                last,
                code,
                reason: reason.to_string(),
            });
            true
        });
    }
}

async fn wait_closed(closed: &mut watch::Receiver<Option<CloseNotice>>) {
    loop {
        let done = closed.borrow_and_update().is_some();
        if done {
            return;
        }
        if closed.changed().await.is_err() {
            // Handle dropped without a close: nothing will ever arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Receiving half handed to the transport that attached.
#[derive(Debug)]
pub struct StreamAttachment {
    pub session_id: String,
    pub stream_id: u64,
    messages: mpsc::Receiver<ServerMessage>,
    closed: watch::Receiver<Option<CloseNotice>>,
    /// Set once the stream is over: the remaining events to hand out.
    ending: Option<VecDeque<StreamEvent>>,
}

impl StreamAttachment {
    /// Next event for the transport; `None` after the close has been handed out.
    ///
    /// A pending close takes priority over queued output, so a consumer that
    /// fell behind still learns promptly that it was closed or replaced.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(ending) = &mut self.ending {
                return ending.pop_front();
            }

            let notice = self.closed.borrow_and_update().clone();
            if let Some(notice) = notice {
                self.ending = Some(notice.into_events());
                continue;
            }

            tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        let notice = self.closed.borrow().clone();
                        self.ending = Some(notice.map(CloseNotice::into_events).unwrap_or_default());
                    }
                }
                msg = self.messages.recv() => match msg {
                    Some(msg) => return Some(StreamEvent::Message(msg)),
                    None => {
                        let notice = self.closed.borrow().clone();
                        self.ending = Some(notice.map(CloseNotice::into_events).unwrap_or_default());
                    }
                },
            }
        }
    }
}

impl SessionManager {
    /// Attach a stream consumer, displacing any existing one. The session
    /// becomes `running` and the first event is always `connected`.
    pub async fn attach_stream(&self, id: &str) -> Option<StreamAttachment> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, messages) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (close_tx, closed) = watch::channel(None);
        let handle = StreamHandle {
            id: stream_id,
            tx,
            close_tx: Arc::new(close_tx),
        };

        let displaced = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            if session.status == SessionStatus::Closed {
                return None;
            }
            // Queued under the lock so no output can overtake it.
            let _ = handle.tx.try_send(ServerMessage::Connected {
                id: session.id.clone(),
                cwd: session.cwd.clone(),
                name: session.name.clone(),
            });
            session.status = SessionStatus::Running;
            session.touch();
            session.attached.replace(handle)
        };

        if let Some(old) = displaced {
            debug!(session_id = id, old_stream = old.id(), stream_id, "stream replaced");
            old.close(CLOSE_REPLACED, "replaced by a newer connection");
        }
        info!(session_id = id, stream_id, "stream attached");

        Some(StreamAttachment {
            session_id: id.to_string(),
            stream_id,
            messages,
            closed,
            ending: None,
        })
    }

    /// Apply one inbound stream message. Returns the reply, if any.
    pub async fn handle_stream_message(
        &self,
        id: &str,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Input { data } => {
                if self.write(id, data.as_bytes()).await {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(id) {
                        if session.status != SessionStatus::Closed {
                            session.status = SessionStatus::Running;
                        }
                    }
                }
                None
            }
            ClientMessage::Resize { cols, rows } => {
                if !self.resize(id, cols, rows).await {
                    debug!(session_id = id, cols, rows, "stream resize ignored");
                }
                None
            }
            ClientMessage::Ping => Some(ServerMessage::Pong),
        }
    }

    /// The consumer behind `stream_id` went away. Only the currently attached
    /// stream may return the session to `idle`.
    pub async fn release_stream(&self, id: &str, stream_id: u64) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        if session.attached.as_ref().map(StreamHandle::id) != Some(stream_id) {
            return;
        }
        session.attached = None;
        if session.status != SessionStatus::Closed {
            session.status = SessionStatus::Idle;
        }
        debug!(session_id = id, stream_id, "stream released");
    }
}

/// Drain the PTY for session `id` until EOF, then report the exit.
pub(crate) fn spawn_output_pump(
    sessions: SessionMap,
    id: String,
    mut reader: Box<dyn Read + Send>,
    pty: PtyHandle,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                // EIO once the child side closes; either way the stream is over.
                Err(_) => break,
            }
        }
    });

    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::default();

        while let Some(chunk) = rx.recv().await {
            let text = decoder.decode(&chunk);
            if text.is_empty() {
                continue;
            }
            let (stream, recorder) = {
                let mut map = sessions.write().await;
                let Some(session) = map.get_mut(&id) else {
                    continue;
                };
                session.output.push_output(&text);
                session.touch();
                (session.attached.clone(), session.recorder.clone())
            };
            if let Some(stream) = stream {
                if !stream.send(ServerMessage::Output { data: text.clone() }).await {
                    debug!(session_id = %id, "stream consumer gone, dropping output");
                }
            }
            if let Some(recorder) = recorder {
                recorder.record(RecordingEvent::Output(text)).await;
            }
        }

        let exit = pty.wait().await;

        let session = {
            let mut map = sessions.write().await;
            match map.get(&id) {
                // Closed sessions are being torn down by `close`/`detach`.
                Some(s) if s.status != SessionStatus::Closed => map.remove(&id),
                _ => None,
            }
        };
        let Some(mut session) = session else {
            return;
        };

        info!(session_id = %id, code = exit.code, signal = ?exit.signal, "session process exited");
        if let Some(stream) = session.attached.take() {
            let exit_msg = ServerMessage::Exit {
                code: exit.code,
                signal: exit.signal.clone(),
            };
            stream.finish(Some(exit_msg), CLOSE_NORMAL, "process exited");
        }
        if let Some(recorder) = &session.recorder {
            recorder.record(RecordingEvent::Exit { code: exit.code }).await;
            recorder.stop();
        }
        if session.persistent_name.is_some() {
            warn!(session_id = %id, persistent = ?session.persistent_name, "tmux bridge exited");
        }
    });
}
