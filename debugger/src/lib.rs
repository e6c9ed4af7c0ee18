//! Host side control of a debugging session.
//!
//! The [`Controller`] launches a worker, forwards commands to it and hands
//! the worker's events to an [`EventHandler`].
mod controller;
mod handler;
mod process;
mod types;

pub use controller::{Controller, ControllerOptions, ExecutionState, LaunchRequest};
pub use handler::{EventHandler, InteractiveCallback, InteractiveOutcome, OutputStream, Scope};
pub use process::{
    Connection, Launcher, ProcessLauncher, WorkerCommand, WorkerHandle, WorkerProcess,
};
pub use types::Breakpoint;
