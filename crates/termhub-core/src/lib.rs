//! termhub-core: Shared protocol library for the terminal session manager.
//!
//! Provides the stream and control message types exchanged with consumers,
//! a JSON text codec, session summaries, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode};
pub use error::{TermError, TermResult};
pub use messages::{
    ClientMessage, ControlRequest, ControlResponse, ErrorKind, PersistentSessionInfo,
    ServerMessage, SessionStatus, SessionSummary, CLOSE_NORMAL, CLOSE_REPLACED,
    CLOSE_UNKNOWN_SESSION,
};
