//! Structured session transcripts.
//!
//! Records timestamped events (output, input, resize, exit) to
//! `<dir>/<session-id>.jsonl`, one JSON object per line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Event types that can appear in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RecordingEvent {
    /// Session started with a given command line.
    Start { command: String },
    /// Raw process output.
    Output(String),
    /// Consumer input.
    Input(String),
    Resize { cols: u16, rows: u16 },
    /// Backing process exited.
    Exit { code: i32 },
    /// Session closed or detached by the manager.
    Closed { detached: bool },
}

/// A single timestamped line in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// Milliseconds since recording start.
    pub timestamp_ms: u64,
    pub event: RecordingEvent,
}

/// Appends events for one session. Shared between the output pump and the
/// operation paths, so writes are serialized internally. The transcript is
/// opened on the first event and kept open until the recorder stops.
pub struct SessionRecorder {
    path: PathBuf,
    start_time: std::time::Instant,
    active: AtomicBool,
    file: Mutex<Option<File>>,
}

impl SessionRecorder {
    pub fn new(dir: &Path, session_id: &str) -> Self {
        Self {
            path: dir.join(format!("{session_id}.jsonl")),
            start_time: std::time::Instant::now(),
            active: AtomicBool::new(true),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Failures are logged and swallowed so a broken
    /// transcript never disturbs the session.
    pub async fn record(&self, event: RecordingEvent) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }

        let entry = RecordingEntry {
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            event,
        };

        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize recording event");
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        if let Err(e) = self.append_line(&mut file, &line).await {
            error!(path = %self.path.display(), error = %e, "failed to write recording");
        }
    }

    /// Stop recording; later events are dropped.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
        // A writer holding the lock drops the handle with the recorder instead.
        if let Ok(mut file) = self.file.try_lock() {
            file.take();
        }
        debug!(path = %self.path.display(), "recording stopped");
    }

    async fn append_line(&self, slot: &mut Option<File>, line: &str) -> std::io::Result<()> {
        if slot.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *slot = Some(file);
        }
        let Some(file) = slot.as_mut() else {
            return Ok(());
        };
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if result.is_err() {
            // Reopen on the next event.
            *slot = None;
        }
        result
    }
}

/// Load a transcript, skipping malformed lines.
pub async fn load_recording(path: &Path) -> std::io::Result<Vec<RecordingEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordingEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed recording line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_in_order_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), "abc123");
        recorder
            .record(RecordingEvent::Start {
                command: "/bin/sh".into(),
            })
            .await;
        recorder.record(RecordingEvent::Input("ls\n".into())).await;
        recorder.record(RecordingEvent::Exit { code: 0 }).await;
        recorder.stop();
        recorder.record(RecordingEvent::Output("late".into())).await;

        let entries = load_recording(recorder.path()).await.unwrap();
        let events: Vec<_> = entries.into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                RecordingEvent::Start {
                    command: "/bin/sh".into()
                },
                RecordingEvent::Input("ls\n".into()),
                RecordingEvent::Exit { code: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn transcript_file_is_opened_once() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), "keep-open");
        recorder.record(RecordingEvent::Output("first".into())).await;
        assert!(recorder.path().exists());

        // Later writes go to the already-open handle, not a freshly created file.
        tokio::fs::remove_file(recorder.path()).await.unwrap();
        for i in 0..3 {
            recorder.record(RecordingEvent::Output(format!("chunk {i}"))).await;
        }
        assert!(!recorder.path().exists());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        tokio::fs::write(
            &path,
            "not json\n{\"timestamp_ms\":5,\"event\":{\"type\":\"resize\",\"data\":{\"cols\":80,\"rows\":24}}}\n",
        )
        .await
        .unwrap();
        let entries = load_recording(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, RecordingEvent::Resize { cols: 80, rows: 24 });
    }
}
