//! taskbridge: background task and workflow synchronization core.
//!
//! Long-running generation requests are delegated to a background [`host`]
//! over the [`bridge`], tracked in the foreground by the [`tasks`] queue, and
//! persisted in a [`store`]. Workflow progress is fanned out to subscribers by
//! [`workflows::sync`], and [`workflows::claim`] settles unresolved workflows
//! after a foreground reload.

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod llm;
pub mod store;
pub mod tasks;
pub mod workflows;
