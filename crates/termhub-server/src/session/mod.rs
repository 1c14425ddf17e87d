//! Session management: PTY lifecycle, preview buffer, streams, persistence, recording.

pub mod ansi;
pub mod manager;
pub mod persist;
pub mod pty;
pub mod recording;
pub mod ring_buffer;
pub mod stream;
pub mod terminate;

pub use manager::{CreateOptions, SessionManager, SessionSettings};
pub use persist::{PersistenceBridge, ReadinessPolicy};
pub use stream::StreamEvent;
pub use terminate::{Escalation, NixSignaller};
