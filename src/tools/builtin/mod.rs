//! Built-in tools for file operations, code search and shell execution.

pub mod file;
pub mod search;
pub mod shell;

pub use file::{ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use search::SearchCodeTool;
pub use shell::RunCommandTool;
