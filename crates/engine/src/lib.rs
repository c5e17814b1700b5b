//! Engine crate – headless nettest task engine.
//!
//! Hosts (the CLI, the daemon, foreign callers through [`ffi`]) start tasks
//! in a [`HandleTable`], poll them for JSON events and interrupt or destroy
//! them by handle. Network collaborators sit behind the traits in
//! [`traits`], so tests and embedders can swap them out.

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod ffi;
pub mod handles;
pub mod measurement;
pub mod nettest;
pub mod nettests;
pub mod platform;
mod runner;
pub mod settings;
pub mod task;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use admission::Admission;
pub use config::EngineConfig;
pub use context::{EngineContext, RunContext};
pub use event::{Event, TERMINATED};
pub use handles::HandleTable;
pub use nettests::NettestRegistry;
pub use settings::Settings;
pub use task::{Task, TaskState};
