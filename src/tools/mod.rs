//! Sandboxed tools exposed to worker sessions.

pub mod builtin;
pub mod registry;
pub mod sandbox;
pub mod tool;

pub use registry::ToolRegistry;
pub use sandbox::Sandbox;
pub use tool::*;
