use std::{collections::BTreeMap, path::Path};

use transport::{BreakpointAction, Frame, SerializedValue};

/// Which of the debuggee's streams produced some output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

pub type Scope = BTreeMap<String, SerializedValue>;

/// Callbacks invoked by [`crate::Controller::poll`], in the order events
/// arrive from the worker.
///
/// Every method has a no-op default so front ends only implement what they
/// display.
pub trait EventHandler {
    /// The debuggee paused at `file:line`.
    fn on_line(&mut self, _file: &Path, _line: u32) {}

    /// Call stack of the current pause, outermost frame first.
    fn on_stack(&mut self, _frames: &[Frame]) {}

    fn on_variables(&mut self, _locals: &Scope, _globals: &Scope) {}

    fn on_output(&mut self, _stream: OutputStream, _text: &str) {}

    /// The debuggee is blocked reading input. `None` cancels the read, which
    /// the debuggee sees as end of input.
    ///
    /// A handler that waits on the user should give up once `worker_alive`
    /// returns false.
    fn on_input_request(
        &mut self,
        _prompt: &str,
        _worker_alive: &mut dyn FnMut() -> bool,
    ) -> Option<String> {
        None
    }

    fn on_eval_result(&mut self, _expression: &str, _repr: &str, _success: bool) {}

    fn on_breakpoint_status(
        &mut self,
        _action: BreakpointAction,
        _file: &Path,
        _line: u32,
        _error: Option<&str>,
    ) {
    }

    /// The session is over. Called exactly once per launch.
    fn on_finished(&mut self) {}
}

/// Result handed to the callback of [`crate::Controller::exec_interactive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveOutcome {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub error: Option<String>,
}

impl InteractiveOutcome {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            error: Some(reason.into()),
        }
    }
}

pub type InteractiveCallback = Box<dyn FnOnce(InteractiveOutcome)>;
