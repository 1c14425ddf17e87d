//! Message types for the stream and control channels.
//!
//! Every frame is a JSON text message. Stream frames are tagged by `type`,
//! control requests by `op` and control responses by `result`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// WebSocket close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code sent to a stream displaced by a newer attachment.
pub const CLOSE_REPLACED: u16 = 4001;
/// WebSocket close code for an attach to an id that is not registered.
pub const CLOSE_UNKNOWN_SESSION: u16 = 4004;

// ── Stream channel ────────────────────────────────────────────────────

/// Messages a consumer sends over an attached stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// Messages the manager pushes to an attached stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        id: String,
        cwd: PathBuf,
        name: String,
    },
    Output {
        data: String,
    },
    Exit {
        code: i32,
        #[serde(default)]
        signal: Option<String>,
    },
    Pong,
}

// ── Session metadata ──────────────────────────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Process alive, no consumer relaying.
    Idle,
    /// A consumer is attached and relaying.
    Running,
    /// Backing process gone. Terminal.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lightweight view of a session, independent of attachment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_name: Option<String>,
}

/// A tmux session living under the manager's namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentSessionInfo {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub attached: u32,
    pub windows: u32,
}

// ── Control channel ───────────────────────────────────────────────────

/// Operations a consumer can invoke on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Create {
        cwd: PathBuf,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        persist: bool,
    },
    Reconnect {
        name: String,
        cwd: PathBuf,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    List,
    Get {
        id: String,
    },
    Rename {
        id: String,
        name: String,
    },
    Write {
        id: String,
        data: String,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Close {
        id: String,
        #[serde(default = "default_true")]
        kill_persistent: bool,
    },
    Detach {
        id: String,
    },
    Recent {
        id: String,
        #[serde(default = "default_recent_lines")]
        max_lines: usize,
    },
    PersistentList,
    Capabilities,
    /// Reserve `count` ports from the shared pool.
    AllocatePorts {
        count: usize,
    },
    /// Return ports to the shared pool. Unknown ports are ignored.
    ReleasePorts {
        ports: Vec<u16>,
    },
}

fn default_true() -> bool {
    true
}

fn default_recent_lines() -> usize {
    50
}

/// Failure category carried by a control error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Failed,
}

/// Replies on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Session { session: SessionSummary },
    Sessions { sessions: Vec<SessionSummary> },
    Ok { success: bool },
    Lines { lines: Vec<String> },
    Persistent { sessions: Vec<PersistentSessionInfo> },
    Capabilities { persistence: bool },
    Ports { ports: Vec<u16> },
    Error { kind: ErrorKind, message: String },
}

impl ControlResponse {
    pub fn not_found(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            kind: ErrorKind::Failed,
            message: message.into(),
        }
    }
}
