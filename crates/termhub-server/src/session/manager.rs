//! Session registry and lifecycle.
//!
//! Owns the id → session table, the idle/running/closed state machine, and
//! every operation that creates, mutates, or tears a session down.

use super::persist::{default_shell, PersistenceBridge, ReadinessPolicy};
use super::pty::{PtyHandle, SpawnSpec};
use super::recording::{RecordingEvent, SessionRecorder};
use super::ring_buffer::{OutputBuffer, DEFAULT_BUFFER_LINES};
use super::stream::{spawn_output_pump, StreamHandle};
use super::terminate::{Escalation, NixSignaller, Signaller, DEFAULT_GRACE};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termhub_core::messages::CLOSE_NORMAL;
use termhub_core::{
    PersistentSessionInfo, SessionStatus, SessionSummary, TermError, TermResult,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub(crate) type SessionMap = Arc<RwLock<HashMap<String, Session>>>;

/// Tunables applied to every session the manager creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub buffer_lines: usize,
    pub cols: u16,
    pub rows: u16,
    /// Wait between SIGTERM and SIGKILL when tearing down persistent sessions.
    pub grace: Duration,
    pub readiness: ReadinessPolicy,
    pub recording_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_lines: DEFAULT_BUFFER_LINES,
            cols: 120,
            rows: 32,
            grace: DEFAULT_GRACE,
            readiness: ReadinessPolicy::default(),
            recording_dir: None,
        }
    }
}

/// Arguments to [`SessionManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub cwd: PathBuf,
    pub name: Option<String>,
    /// Program to run; the caller's shell when absent.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Back the session with tmux when available.
    pub persist: bool,
}

impl CreateOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn command(mut self, program: impl Into<String>, args: &[&str]) -> Self {
        self.command = Some(program.into());
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// One managed session.
pub struct Session {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    /// The PTY backing this session (the process itself or a tmux client).
    pub pty: PtyHandle,
    /// Full tmux session name when bridged.
    pub persistent_name: Option<String>,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub output: OutputBuffer,
    /// Registration order, for stable listing.
    order: u64,
    pub(crate) attached: Option<StreamHandle>,
    pub recorder: Option<Arc<SessionRecorder>>,
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            pid: self.pid,
            created_at: self.created_at,
            last_activity_at: self.last_activity,
            persistent_name: self.persistent_name.clone(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }
}

/// Manages all live sessions.
pub struct SessionManager {
    pub(crate) sessions: SessionMap,
    bridge: Option<Arc<PersistenceBridge>>,
    escalation: Escalation,
    settings: SessionSettings,
    next_order: AtomicU64,
    pub(crate) next_stream_id: AtomicU64,
}

impl SessionManager {
    /// Create a manager. `bridge` is the already-detected persistence
    /// capability; `None` disables tmux backing for the manager's lifetime.
    pub fn new(
        settings: SessionSettings,
        bridge: Option<PersistenceBridge>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            bridge: bridge.map(Arc::new),
            escalation: Escalation::new(signaller, settings.grace),
            settings,
            next_order: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Probe the host for tmux once and build a manager around the result.
    pub async fn detect(settings: SessionSettings) -> Self {
        let bridge =
            PersistenceBridge::detect(settings.readiness, settings.cols, settings.rows).await;
        Self::new(settings, bridge, Arc::new(NixSignaller))
    }

    pub fn is_persistence_available(&self) -> bool {
        self.bridge.is_some()
    }

    /// Create a new session in `idle`.
    pub async fn create(&self, opts: CreateOptions) -> TermResult<SessionSummary> {
        let cwd = resolve_directory(&opts.cwd).await?;
        let id = generate_session_id();
        let name = opts
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(&cwd));
        let program = opts.command.clone().unwrap_or_else(default_shell);
        let command_line = shlex::try_join(
            std::iter::once(program.as_str()).chain(opts.args.iter().map(String::as_str)),
        )
        .map_err(|e| TermError::Spawn(format!("cannot quote command: {e}")))?;

        let direct = SpawnSpec {
            program,
            args: opts.args.clone(),
            cwd: cwd.clone(),
            env: opts.env.clone(),
            unset: Vec::new(),
            cols: self.settings.cols,
            rows: self.settings.rows,
        };

        let (spec, persistent_name) = match (&self.bridge, opts.persist) {
            (Some(bridge), true) => {
                let base = format!("{name}-{}", &id[..8]);
                let wrapped = opts.command.is_some().then_some(command_line.as_str());
                let full = bridge.create_session(&base, &cwd, wrapped, &opts.env).await?;
                (bridge.attach_spec(&full, &cwd, &opts.env), Some(full))
            }
            (None, true) => {
                warn!("persistence requested but unavailable, spawning directly");
                (direct, None)
            }
            _ => (direct, None),
        };

        let result = self
            .register(id, name, cwd, spec, persistent_name.clone(), command_line)
            .await;
        if result.is_err() {
            if let (Some(full), Some(bridge)) = (&persistent_name, &self.bridge) {
                bridge.kill_session(full).await;
            }
        }
        result
    }

    /// Bridge a fresh session onto an existing persistent session. `None`
    /// when it does not exist or persistence is unavailable.
    pub async fn reconnect(
        &self,
        name: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> TermResult<Option<SessionSummary>> {
        let Some(bridge) = &self.bridge else {
            return Ok(None);
        };
        if !bridge.session_exists(name).await {
            debug!(name, "reconnect target does not exist");
            return Ok(None);
        }

        let cwd = resolve_directory(cwd).await?;
        let full = super::persist::full_name(name);
        let label = full
            .strip_prefix(super::persist::SESSION_PREFIX)
            .unwrap_or(&full)
            .to_string();
        let spec = bridge.attach_spec(&full, &cwd, env);
        let summary = self
            .register(
                generate_session_id(),
                label,
                cwd,
                spec,
                Some(full.clone()),
                format!("reconnect {full}"),
            )
            .await?;
        info!(session_id = %summary.id, persistent = %full, "reconnected to persistent session");
        Ok(Some(summary))
    }

    /// Spawn the PTY, insert the session, and start its output pump.
    async fn register(
        &self,
        id: String,
        name: String,
        cwd: PathBuf,
        spec: SpawnSpec,
        persistent_name: Option<String>,
        command_line: String,
    ) -> TermResult<SessionSummary> {
        let (pty, reader) = PtyHandle::spawn(&spec)?;

        let recorder = self
            .settings
            .recording_dir
            .as_deref()
            .map(|dir| Arc::new(SessionRecorder::new(dir, &id)));
        if let Some(recorder) = &recorder {
            recorder
                .record(RecordingEvent::Start {
                    command: command_line,
                })
                .await;
        }

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name,
            cwd,
            pid: pty.pid(),
            pty: pty.clone(),
            persistent_name,
            status: SessionStatus::Idle,
            created_at: now,
            last_activity: now,
            output: OutputBuffer::new(self.settings.buffer_lines),
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            attached: None,
            recorder,
        };
        let summary = session.summary();

        self.sessions.write().await.insert(id.clone(), session);
        info!(session_id = %id, pid = ?summary.pid, persistent = ?summary.persistent_name, "session created");

        spawn_output_pump(self.sessions.clone(), id, reader, pty);
        Ok(summary)
    }

    pub async fn get(&self, id: &str) -> Option<SessionSummary> {
        self.sessions.read().await.get(id).map(Session::summary)
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut ordered: Vec<&Session> = sessions.values().collect();
        ordered.sort_by_key(|s| s.order);
        ordered.into_iter().map(Session::summary).collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn rename(&self, id: &str, name: String) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                debug!(session_id = id, name = %name, "session renamed");
                session.name = name;
                true
            }
            None => false,
        }
    }

    /// Forward input to the backing process. False if unknown, closed, or
    /// the write fails.
    pub async fn write(&self, id: &str, data: &[u8]) -> bool {
        let (pty, recorder) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            if session.status == SessionStatus::Closed {
                return false;
            }
            session.touch();
            (session.pty.clone(), session.recorder.clone())
        };

        let bytes = data.to_vec();
        let written = tokio::task::spawn_blocking(move || pty.write(&bytes)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = id, error = %e, "PTY write failed");
                return false;
            }
            Err(e) => {
                warn!(session_id = id, error = %e, "PTY write task failed");
                return false;
            }
        }

        if let Some(recorder) = recorder {
            recorder
                .record(RecordingEvent::Input(String::from_utf8_lossy(data).into_owned()))
                .await;
        }
        true
    }

    /// Forward terminal geometry. Both dimensions must be positive.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        let (pty, recorder) = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(s) if s.status != SessionStatus::Closed => (s.pty.clone(), s.recorder.clone()),
                _ => return false,
            }
        };
        if let Err(e) = pty.resize(cols, rows) {
            warn!(session_id = id, error = %e, "resize failed");
            return false;
        }
        if let Some(recorder) = recorder {
            recorder.record(RecordingEvent::Resize { cols, rows }).await;
        }
        true
    }

    /// Last `max_lines` of stripped output. Empty when nothing was printed
    /// yet; an error only for an unknown id.
    pub async fn recent_output(&self, id: &str, max_lines: usize) -> TermResult<Vec<String>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|s| s.output.recent(max_lines))
            .ok_or_else(|| TermError::SessionNotFound(id.to_string()))
    }

    pub async fn persistent_name(&self, id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(id)
            .and_then(|s| s.persistent_name.clone())
    }

    /// Every tmux session under our prefix, whether or not a session here
    /// is bridged to it.
    pub async fn list_persistent_sessions(&self) -> Vec<PersistentSessionInfo> {
        let Some(bridge) = &self.bridge else {
            return Vec::new();
        };
        bridge.list_sessions().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to list persistent sessions");
            Vec::new()
        })
    }

    /// Full teardown. False if the id is unknown or already closing.
    pub async fn close(&self, id: &str, kill_persistent: bool) -> bool {
        let (stream, pty, persistent, pid, recorder) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            if session.status == SessionStatus::Closed {
                return false;
            }
            session.status = SessionStatus::Closed;
            (
                session.attached.take(),
                session.pty.clone(),
                session.persistent_name.clone(),
                session.pid,
                session.recorder.clone(),
            )
        };

        if let Some(stream) = stream {
            stream.close(CLOSE_NORMAL, "session closed");
        }

        if let (Some(name), true, Some(bridge)) = (&persistent, kill_persistent, &self.bridge) {
            bridge.terminate(name, &self.escalation).await;
        }

        if let Err(e) = pty.kill() {
            debug!(session_id = id, error = %e, "PTY kill failed (already exited?)");
        }

        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            if self
                .escalation
                .signaller()
                .signal_process(pid, super::terminate::KillSignal::Kill)
            {
                debug!(session_id = id, pid, "defensive SIGKILL delivered");
            }
        }

        self.sessions.write().await.remove(id);
        if let Some(recorder) = recorder {
            recorder.record(RecordingEvent::Closed { detached: false }).await;
            recorder.stop();
        }
        info!(session_id = id, kill_persistent, "session closed");
        true
    }

    /// Drop the local bridge and stream but leave the tmux session running.
    /// Without a persistent session this is `close(id, false)`.
    pub async fn detach(&self, id: &str) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(id) {
                None => return false,
                Some(s) if s.persistent_name.is_none() => None,
                Some(_) => sessions.remove(id),
            }
        };
        let Some(mut session) = session else {
            return self.close(id, false).await;
        };

        session.status = SessionStatus::Closed;
        if let Some(stream) = session.attached.take() {
            stream.close(CLOSE_NORMAL, "session detached");
        }
        if let Err(e) = session.pty.kill() {
            debug!(session_id = id, error = %e, "bridge kill failed (already exited?)");
        }
        if let Some(recorder) = &session.recorder {
            recorder.record(RecordingEvent::Closed { detached: true }).await;
            recorder.stop();
        }
        info!(session_id = id, persistent = ?session.persistent_name, "session detached");
        true
    }

    /// Detach every persistent session and close the rest.
    pub async fn shutdown(&self) {
        let ids: Vec<(String, bool)> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| (s.id.clone(), s.persistent_name.is_some()))
            .collect();
        for (id, persisted) in ids {
            if persisted {
                self.detach(&id).await;
            } else {
                self.close(&id, false).await;
            }
        }
    }
}

async fn resolve_directory(path: &Path) -> TermResult<PathBuf> {
    let invalid = || TermError::InvalidDirectory(path.display().to_string());
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::canonicalize(path).await.map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn default_name(cwd: &Path) -> String {
    cwd.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "terminal".to_string())
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::stream::{StreamAttachment, StreamEvent};
    use termhub_core::messages::CLOSE_REPLACED;
    use termhub_core::ServerMessage;

    fn manager() -> SessionManager {
        SessionManager::new(SessionSettings::default(), None, Arc::new(NixSignaller))
    }

    fn shell(cwd: &Path) -> CreateOptions {
        CreateOptions::new(cwd).command("/bin/sh", &[])
    }

    async fn next_event(stream: &mut StreamAttachment) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(10), stream.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("stream channel closed")
    }

    /// Collect output until `needle` shows up in the stripped text.
    async fn wait_for_output(stream: &mut StreamAttachment, needle: &str) -> String {
        let mut seen = String::new();
        loop {
            match next_event(stream).await {
                StreamEvent::Message(ServerMessage::Output { data }) => {
                    seen.push_str(&crate::session::ansi::strip_control(&data));
                    if seen.contains(needle) {
                        return seen;
                    }
                }
                StreamEvent::Message(_) => {}
                StreamEvent::Close { code, .. } => panic!("stream closed ({code}) before {needle:?}"),
            }
        }
    }

    #[tokio::test]
    async fn status_follows_stream_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let created = mgr.create(shell(dir.path())).await.unwrap();
        assert_eq!(created.status, SessionStatus::Idle);
        assert!(created.pid.is_some());

        let attachment = mgr.attach_stream(&created.id).await.unwrap();
        assert_eq!(mgr.get(&created.id).await.unwrap().status, SessionStatus::Running);

        mgr.release_stream(&created.id, attachment.stream_id).await;
        assert_eq!(mgr.get(&created.id).await.unwrap().status, SessionStatus::Idle);

        assert!(mgr.close(&created.id, true).await);
    }

    #[tokio::test]
    async fn close_unknown_is_false() {
        let mgr = manager();
        assert!(!mgr.close("nope", true).await);
        assert!(!mgr.detach("nope").await);
        assert!(!mgr.rename("nope", "x".into()).await);
        assert!(!mgr.write("nope", b"ls\n").await);
        assert!(!mgr.resize("nope", 80, 24).await);
    }

    #[tokio::test]
    async fn missing_directory_fails_without_registering() {
        let mgr = manager();
        let err = mgr
            .create(CreateOptions::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, TermError::InvalidDirectory(_)));
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let err = mgr
            .create(CreateOptions::new(dir.path()).command("/no/such/binary", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, TermError::Spawn(_)));
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn recent_output_empty_versus_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        // `cat` prints nothing until fed.
        let created = mgr
            .create(CreateOptions::new(dir.path()).command("cat", &[]))
            .await
            .unwrap();
        assert!(mgr.recent_output(&created.id, 10).await.unwrap().is_empty());
        assert!(mgr.recent_output("nope", 10).await.unwrap_err().is_not_found());
        mgr.close(&created.id, true).await;
    }

    #[tokio::test]
    async fn echo_round_trip_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let created = mgr.create(shell(dir.path())).await.unwrap();
        let mut attachment = mgr.attach_stream(&created.id).await.unwrap();

        match next_event(&mut attachment).await {
            StreamEvent::Message(ServerMessage::Connected { id, cwd, .. }) => {
                assert_eq!(id, created.id);
                assert_eq!(cwd, created.cwd);
            }
            other => panic!("expected connected, got {other:?}"),
        }

        assert!(mgr.write(&created.id, b"echo hi-$((40+2))\n").await);
        let seen = wait_for_output(&mut attachment, "hi-42").await;
        assert!(seen.contains("hi"));

        // The preview buffer saw the same output.
        let mut preview = Vec::new();
        for _ in 0..50 {
            preview = mgr.recent_output(&created.id, 50).await.unwrap();
            if preview.iter().any(|l| l.contains("hi-42")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(preview.iter().any(|l| l.contains("hi-42")));
        assert!(preview.iter().all(|l| !l.contains('\x1b')));

        assert!(mgr.close(&created.id, true).await);
        assert!(mgr.get(&created.id).await.is_none());
        assert!(!mgr.close(&created.id, true).await);

        match next_event(&mut attachment).await {
            StreamEvent::Close { code, .. } => assert_eq!(code, CLOSE_NORMAL),
            StreamEvent::Message(_) => {
                // Output raced the close; the close must still follow.
                loop {
                    if let StreamEvent::Close { code, .. } = next_event(&mut attachment).await {
                        assert_eq!(code, CLOSE_NORMAL);
                        break;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn second_attach_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let created = mgr.create(shell(dir.path())).await.unwrap();

        let mut first = mgr.attach_stream(&created.id).await.unwrap();
        let second = mgr.attach_stream(&created.id).await.unwrap();
        assert_ne!(first.stream_id, second.stream_id);

        let mut replaced = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), first.recv()).await
        {
            if let StreamEvent::Close { code, .. } = event {
                assert_eq!(code, CLOSE_REPLACED);
                replaced = true;
                break;
            }
        }
        assert!(replaced);

        // A late release from the displaced stream must not detach the new one.
        mgr.release_stream(&created.id, first.stream_id).await;
        assert_eq!(mgr.get(&created.id).await.unwrap().status, SessionStatus::Running);

        mgr.close(&created.id, true).await;
    }

    #[tokio::test]
    async fn process_exit_notifies_stream_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let created = mgr
            .create(CreateOptions::new(dir.path()).command("/bin/sh", &["-c", "read x; exit 7"]))
            .await
            .unwrap();
        let mut attachment = mgr.attach_stream(&created.id).await.unwrap();
        assert!(mgr.write(&created.id, b"go\n").await);

        let exit = loop {
            match next_event(&mut attachment).await {
                StreamEvent::Message(ServerMessage::Exit { code, signal }) => break (code, signal),
                StreamEvent::Message(_) => continue,
                StreamEvent::Close { code, .. } => panic!("closed ({code}) before exit event"),
            }
        };
        assert_eq!(exit, (7, None));
        match next_event(&mut attachment).await {
            StreamEvent::Close { code, .. } => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("expected close after exit, got {other:?}"),
        }
        assert!(mgr.get(&created.id).await.is_none());
        assert!(!mgr.write(&created.id, b"ls\n").await);
    }

    #[tokio::test]
    async fn detach_without_persistence_is_close() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let created = mgr
            .create(shell(dir.path()).persist(true))
            .await
            .unwrap();
        // No bridge: the persist flag degrades to a direct process.
        assert!(created.persistent_name.is_none());
        assert!(mgr.detach(&created.id).await);
        assert!(mgr.get(&created.id).await.is_none());
        assert!(!mgr.detach(&created.id).await);
    }

    #[tokio::test]
    async fn rename_resize_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let a = mgr.create(shell(dir.path())).await.unwrap();
        let b = mgr.create(shell(dir.path())).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, dir.path().canonicalize().unwrap().file_name().unwrap().to_string_lossy());

        assert!(mgr.rename(&a.id, "api server".into()).await);
        assert_eq!(mgr.get(&a.id).await.unwrap().name, "api server");

        assert!(mgr.resize(&a.id, 100, 30).await);
        assert!(!mgr.resize(&a.id, 0, 30).await);

        let ids: Vec<String> = mgr.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        mgr.shutdown().await;
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_without_reference_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::detect(SessionSettings::default()).await;
        let found = mgr
            .reconnect("never-created-xyz", dir.path(), &HashMap::new())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn persistent_session_survives_detach() {
        let mgr = SessionManager::detect(SessionSettings {
            grace: Duration::from_millis(100),
            ..SessionSettings::default()
        })
        .await;
        if !mgr.is_persistence_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let created = mgr
            .create(
                CreateOptions::new(dir.path())
                    .command("sleep", &["60"])
                    .persist(true),
            )
            .await
            .unwrap();
        let persistent = created.persistent_name.clone().unwrap();

        assert!(mgr.detach(&created.id).await);
        assert!(mgr.get(&created.id).await.is_none());
        assert!(mgr
            .list_persistent_sessions()
            .await
            .iter()
            .any(|s| s.name == persistent));

        let again = mgr
            .reconnect(&persistent, dir.path(), &HashMap::new())
            .await
            .unwrap()
            .expect("persistent session should still exist");
        assert_ne!(again.id, created.id);
        assert_eq!(again.persistent_name.as_deref(), Some(persistent.as_str()));

        assert!(mgr.close(&again.id, true).await);
        assert!(!mgr
            .list_persistent_sessions()
            .await
            .iter()
            .any(|s| s.name == persistent));
    }
}
