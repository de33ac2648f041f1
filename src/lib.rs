//! taskforce: a team of autonomous LLM workers.
//!
//! The commander routes work to workers, the orchestrator runs one sandboxed
//! chat/tool session per worker, and the autonomous loop keeps pending and
//! stalled tasks moving.

pub mod autonomous;
pub mod commander;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod tools;
pub mod worker;
