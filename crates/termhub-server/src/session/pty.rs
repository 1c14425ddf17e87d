//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a given program in a working directory,
//! providing write, resize, kill, and exit polling. The output side is handed
//! out once at spawn time so exactly one pump drains it.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use termhub_core::{TermError, TermResult};

/// What to run inside a new PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Inherited variables to drop from the child's environment.
    pub unset: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Exit details reported when a PTY child terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<String>,
}

/// A managed PTY instance. Clones share the same underlying PTY.
#[derive(Clone)]
pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn `spec` in a new PTY. Returns the handle and the output reader.
    pub fn spawn(spec: &SpawnSpec) -> TermResult<(Self, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| TermError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        for key in &spec.unset {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(format!("{}: {e}", spec.program)))?;
        // The child holds its own copy; ours would keep the reader from seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!(program = %spec.program, pid, cols = spec.cols, rows = spec.rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let handle = Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            pid,
        };
        Ok((handle, reader))
    }

    /// OS process id of the child, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write to the PTY input.
    pub fn write(&self, data: &[u8]) -> TermResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TermError::Other("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TermError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TermError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Kill the child process.
    pub fn kill(&self) -> TermResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| TermError::Other("child lock poisoned".into()))?;
        child.kill()?;
        Ok(())
    }

    /// Non-blocking exit check.
    pub fn try_wait(&self) -> TermResult<Option<ExitInfo>> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| TermError::Other("child lock poisoned".into()))?;
        Ok(child.try_wait()?.map(|status| ExitInfo {
            code: i32::try_from(status.exit_code()).unwrap_or(-1),
            signal: status.signal().map(str::to_string),
        }))
    }

    /// Wait for the child to exit without holding the child lock, so a
    /// concurrent `kill` is never blocked behind the wait.
    pub async fn wait(&self) -> ExitInfo {
        let mut delay = std::time::Duration::from_millis(20);
        loop {
            match self.try_wait() {
                Ok(Some(info)) => {
                    info!(code = info.code, signal = ?info.signal, "PTY child exited");
                    return info;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "PTY wait failed");
                    return ExitInfo {
                        code: -1,
                        signal: None,
                    };
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(std::time::Duration::from_secs(1));
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Incremental UTF-8 decoder that carries split multi-byte sequences across
/// reads. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Safe: from_utf8 just validated this prefix.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo ✓".as_bytes();
        // Split inside the two-byte é and inside the three-byte ✓.
        let mut out = decoder.decode(&bytes[..2]);
        out.push_str(&decoder.decode(&bytes[2..bytes.len() - 1]));
        out.push_str(&decoder.decode(&bytes[bytes.len() - 1..]));
        assert_eq!(out, "héllo ✓");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn spawn_write_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "read line; exit 3".into()],
            cwd: dir.path().to_path_buf(),
            env: HashMap::new(),
            unset: Vec::new(),
            cols: 80,
            rows: 24,
        };
        let (pty, _reader) = PtyHandle::spawn(&spec).unwrap();
        assert!(pty.pid().is_some());
        pty.write(b"go\n").unwrap();
        let info = pty.wait().await;
        assert_eq!(info.code, 3);
    }

    #[tokio::test]
    async fn signalled_exit_reports_the_signal() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec {
            program: "sleep".into(),
            args: vec!["30".into()],
            cwd: dir.path().to_path_buf(),
            env: HashMap::new(),
            unset: Vec::new(),
            cols: 80,
            rows: 24,
        };
        let (pty, _reader) = PtyHandle::spawn(&spec).unwrap();
        let pid = pty.pid().unwrap();
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).unwrap();

        let info = tokio::time::timeout(std::time::Duration::from_secs(10), pty.wait())
            .await
            .unwrap();
        assert!(info.signal.is_some(), "no signal in {info:?}");
    }

    #[test]
    fn spawn_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec {
            program: "/definitely/not/a/program".into(),
            args: Vec::new(),
            cwd: dir.path().to_path_buf(),
            env: HashMap::new(),
            unset: Vec::new(),
            cols: 80,
            rows: 24,
        };
        assert!(matches!(PtyHandle::spawn(&spec), Err(TermError::Spawn(_))));
    }
}
