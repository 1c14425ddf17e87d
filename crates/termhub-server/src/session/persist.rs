//! tmux-backed persistent sessions.
//!
//! A persistent session lives in the tmux server, outside this process, under
//! a fixed name prefix. The manager never owns it: it only spawns a bridging
//! `tmux attach-session` client inside a PTY and relays that client's I/O.

use super::pty::SpawnSpec;
use super::terminate::{Escalation, TerminationReport};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use termhub_core::{PersistentSessionInfo, TermError, TermResult};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Namespace prefix separating our sessions from anyone else's on the same tmux server.
pub const SESSION_PREFIX: &str = "termhub_";

/// Bounded poll used to confirm a freshly created tmux session is live.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(400),
        }
    }
}

/// Replace every character tmux might interpret in a target with `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Full tmux session name for a caller-supplied name. Already-prefixed names
/// (as returned by `list_sessions`) are kept as they are.
pub fn full_name(name: &str) -> String {
    let clean = sanitize_name(name);
    if clean.starts_with(SESSION_PREFIX) {
        clean
    } else {
        format!("{SESSION_PREFIX}{clean}")
    }
}

/// Shell line that runs `command` and then stays alive in an interactive
/// shell, so a finished agent does not take the whole session with it.
pub fn wrapper_command(command: &str, shell: &str) -> String {
    let shell = shlex::try_quote(shell)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| "/bin/sh".to_string());
    format!("{command}; exec {shell} -l")
}

/// Parse `list-sessions` output produced with [`LIST_FORMAT`], keeping only
/// names under our prefix.
pub fn parse_session_list(stdout: &str) -> Vec<PersistentSessionInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?;
            if !name.starts_with(SESSION_PREFIX) {
                return None;
            }
            let created = fields
                .next()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            let attached = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            let windows = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            Some(PersistentSessionInfo {
                name: name.to_string(),
                created,
                attached,
                windows,
            })
        })
        .collect()
}

const LIST_FORMAT: &str =
    "#{session_name}\t#{session_created}\t#{session_attached}\t#{session_windows}";

/// Handle to the host's tmux. Only constructed when tmux is actually present.
#[derive(Debug, Clone)]
pub struct PersistenceBridge {
    program: PathBuf,
    readiness: ReadinessPolicy,
    cols: u16,
    rows: u16,
}

impl PersistenceBridge {
    /// Probe the host for tmux once. `None` means persistence is unavailable.
    pub async fn detect(readiness: ReadinessPolicy, cols: u16, rows: u16) -> Option<Self> {
        let program = match which::which("tmux") {
            Ok(path) => path,
            Err(_) => {
                info!("tmux not found, persistent sessions disabled");
                return None;
            }
        };
        match Command::new(&program).arg("-V").output().await {
            Ok(out) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
                info!(%version, path = %program.display(), "tmux available");
                Some(Self {
                    program,
                    readiness,
                    cols,
                    rows,
                })
            }
            Ok(out) => {
                warn!(status = ?out.status, "tmux -V failed, persistent sessions disabled");
                None
            }
            Err(e) => {
                warn!(error = %e, "cannot run tmux, persistent sessions disabled");
                None
            }
        }
    }

    async fn tmux<I, S>(&self, args: I) -> TermResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(&self.program)
            .args(args)
            .env_remove("TMUX")
            .output()
            .await
            .map_err(|e| TermError::Persistence(format!("failed to run tmux: {e}")))
    }

    /// Whether the named session is live right now.
    pub async fn session_exists(&self, name: &str) -> bool {
        let target = format!("={}", full_name(name));
        matches!(
            self.tmux(["has-session", "-t", target.as_str()]).await,
            Ok(out) if out.status.success()
        )
    }

    /// Every session under our prefix. No tmux server means no sessions.
    pub async fn list_sessions(&self) -> TermResult<Vec<PersistentSessionInfo>> {
        let out = self.tmux(["list-sessions", "-F", LIST_FORMAT]).await?;
        if !out.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "tmux list-sessions failed, treating as empty"
            );
            return Ok(Vec::new());
        }
        Ok(parse_session_list(&String::from_utf8_lossy(&out.stdout)))
    }

    /// Create a detached session running `command` (or the default shell) and
    /// wait until tmux reports it live. Returns the full session name.
    pub async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        command: Option<&str>,
        env: &HashMap<String, String>,
    ) -> TermResult<String> {
        let full = full_name(name);
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            full.clone(),
            "-x".into(),
            self.cols.to_string(),
            "-y".into(),
            self.rows.to_string(),
            "-c".into(),
            cwd.display().to_string(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(command) = command {
            args.push(wrapper_command(command, &default_shell()));
        }

        let out = self.tmux(&args).await?;
        if !out.status.success() {
            return Err(TermError::Persistence(format!(
                "tmux new-session {full} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        if let Err(e) = self.wait_until_ready(&full).await {
            self.kill_session(&full).await;
            return Err(e);
        }

        let target = format!("={full}");
        for option in [["status", "off"], ["mouse", "on"]] {
            let out = self
                .tmux(["set-option", "-t", target.as_str(), option[0], option[1]])
                .await?;
            if !out.status.success() {
                warn!(session = %full, option = option[0], "tmux set-option failed");
            }
        }

        info!(session = %full, cwd = %cwd.display(), "persistent session created");
        Ok(full)
    }

    /// Poll `has-session` with exponential backoff until the session appears.
    async fn wait_until_ready(&self, full: &str) -> TermResult<()> {
        let mut delay = self.readiness.initial_backoff;
        for attempt in 1..=self.readiness.attempts {
            if self.session_exists(full).await {
                debug!(session = %full, attempt, "persistent session ready");
                return Ok(());
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.readiness.max_backoff);
        }
        Err(TermError::Persistence(format!(
            "tmux session {full} not ready after {} attempts",
            self.readiness.attempts
        )))
    }

    /// PTY spec for a bridging client attached to an existing session.
    pub fn attach_spec(&self, name: &str, cwd: &Path, env: &HashMap<String, String>) -> SpawnSpec {
        SpawnSpec {
            program: self.program.display().to_string(),
            args: vec![
                "attach-session".into(),
                "-t".into(),
                format!("={}", full_name(name)),
            ],
            cwd: cwd.to_path_buf(),
            env: env.clone(),
            // tmux refuses to nest when it sees its own variable.
            unset: vec!["TMUX".into()],
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Pids of every pane process in the session.
    pub async fn pane_pids(&self, name: &str) -> Vec<i32> {
        let target = format!("={}", full_name(name));
        match self
            .tmux(["list-panes", "-s", "-t", target.as_str(), "-F", "#{pane_pid}"])
            .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Remove the session from tmux.
    pub async fn kill_session(&self, name: &str) -> bool {
        let target = format!("={}", full_name(name));
        matches!(
            self.tmux(["kill-session", "-t", target.as_str()]).await,
            Ok(out) if out.status.success()
        )
    }

    /// Escalate over every pane's process group, then kill the session itself.
    pub async fn terminate(&self, name: &str, escalation: &Escalation) -> TerminationReport {
        let pids = self.pane_pids(name).await;
        let report = escalation.run(&pids).await;
        if !self.kill_session(name).await {
            debug!(session = %name, "tmux kill-session failed (already gone?)");
        }
        info!(session = %name, panes = pids.len(), escalated = report.escalated(), "persistent session terminated");
        report
    }
}

/// The caller's interactive shell.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
