//! Task queue coordinator and its execution plumbing.

pub mod model;
pub(crate) mod persist;
pub mod queue;
pub mod runner;

pub use model::{Task, TaskEvent, TaskPatch, TaskStatus};
pub use queue::{TaskQueue, spawn_prune_task};
pub use runner::TaskRunner;
