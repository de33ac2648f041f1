//! Worker sessions.
//!
//! - `state`: session status machine, output ring buffer, display heuristics
//! - `worker`: the bounded chat/tool loop a session runs

pub mod state;
pub mod worker;

pub use state::{OutputBuffer, SessionStatus, StatusSnapshot, infer_status, tool_status};
pub use worker::{Session, SessionDeps, SessionEvent, SessionEventKind, SessionOutcome};
