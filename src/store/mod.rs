//! Task/record store: worker roster, task records and audit events.

pub mod memory;
pub mod model;
pub mod seed;
pub mod traits;

pub use memory::MemoryStore;
pub use model::{
    Event, EventKind, NewTask, REQUEUE_MARKER, RETRY_MARKER, Task, TaskPriority, TaskStatus, WorkerDefinition,
};
pub use traits::TaskStore;
