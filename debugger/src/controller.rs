use std::{path::PathBuf, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use eyre::WrapErr;
use transport::{BreakpointAction, Command, Event, HostMessage, LaunchArguments, WorkerOptions};

use crate::{
    handler::{EventHandler, InteractiveCallback, InteractiveOutcome, OutputStream},
    process::{Connection, Launcher, WorkerHandle},
    types::Breakpoint,
};

/// Host side view of the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Running,
    Paused,
    Finished,
}

/// What to debug.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Pause on the first line instead of running to the first breakpoint.
    pub stop_on_entry: bool,
}

impl LaunchRequest {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            working_directory: None,
            stop_on_entry: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Upper bound on how long `poll` waits for a dead worker's last
    /// messages.
    pub poll_interval: Duration,
    /// How long a finished worker gets to exit before it is killed.
    pub join_timeout: Duration,
    pub worker: WorkerOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_millis(500),
            worker: WorkerOptions::default(),
        }
    }
}

struct ActiveSession {
    outbox: Box<dyn transport::Outbox<HostMessage>>,
    events: Receiver<Event>,
    worker: Box<dyn WorkerHandle>,
    finished: bool,
}

/// Drives one worker at a time.
///
/// The controller never blocks waiting on the debuggee: call
/// [`Controller::poll`] from the front end's main loop to dispatch whatever
/// the worker sent since the last call.
pub struct Controller {
    launcher: Box<dyn Launcher>,
    options: ControllerOptions,
    breakpoints: Vec<Breakpoint>,
    state: ExecutionState,
    session: Option<ActiveSession>,
    pending: Option<InteractiveCallback>,
}

impl Controller {
    pub fn new(launcher: Box<dyn Launcher>, options: ControllerOptions) -> Self {
        Self {
            launcher,
            options,
            breakpoints: Vec::new(),
            state: ExecutionState::NotStarted,
            session: None,
            pending: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.session.as_ref().and_then(|session| session.worker.id())
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Replace the saved breakpoint list used to seed the next launch.
    pub fn set_breakpoints(&mut self, breakpoints: Vec<Breakpoint>) {
        self.breakpoints = breakpoints;
    }

    #[tracing::instrument(skip(self), fields(script = %request.script.display()))]
    pub fn launch(&mut self, request: LaunchRequest) -> eyre::Result<()> {
        eyre::ensure!(self.session.is_none(), "a debugging session is already active");

        let arguments = LaunchArguments {
            script: request.script,
            breakpoints: self.breakpoints.iter().map(Breakpoint::to_source).collect(),
            args: request.args,
            working_directory: request.working_directory,
            stop_on_entry: request.stop_on_entry,
            options: self.options.worker.clone(),
        };
        let Connection {
            outbox,
            events,
            worker,
        } = self.launcher.launch(arguments).wrap_err("launching worker")?;

        self.session = Some(ActiveSession {
            outbox,
            events,
            worker,
            finished: false,
        });
        self.state = ExecutionState::Running;
        Ok(())
    }

    /// Dispatch everything the worker has sent so far. Never blocks for
    /// longer than the poll interval.
    pub fn poll(&mut self, handler: &mut dyn EventHandler) {
        let Some(events) = self.session.as_ref().map(|session| session.events.clone()) else {
            return;
        };

        loop {
            match events.try_recv() {
                Ok(event) => {
                    if self.dispatch(event, handler) {
                        self.terminate(handler);
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("worker channel closed");
                    self.terminate(handler);
                    return;
                }
            }
        }

        let exited = self
            .session
            .as_mut()
            .is_some_and(|session| session.worker.has_exited());
        if exited {
            tracing::debug!("worker exited, draining remaining events");
            loop {
                match events.recv_timeout(self.options.poll_interval) {
                    Ok(event) => {
                        if self.dispatch(event, handler) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
                }
            }
            self.terminate(handler);
        }
    }

    /// Returns whether the session has finished.
    fn dispatch(&mut self, event: Event, handler: &mut dyn EventHandler) -> bool {
        tracing::debug!(?event, "dispatching event");
        match event {
            Event::Line { file, line } => {
                self.state = ExecutionState::Paused;
                handler.on_line(&file, line);
            }
            Event::Stack { frames } => handler.on_stack(&frames),
            Event::Variables { locals, globals } => handler.on_variables(&locals, &globals),
            Event::StdOut { text } => handler.on_output(OutputStream::Stdout, &text),
            Event::StdErr { text } => handler.on_output(OutputStream::Stderr, &text),
            Event::InputRequest { id, prompt } => {
                let mut worker_alive = || {
                    self.session
                        .as_mut()
                        .is_some_and(|session| !session.worker.has_exited())
                };
                let text = handler
                    .on_input_request(&prompt, &mut worker_alive)
                    .map(|mut text| {
                        if !text.ends_with('\n') {
                            text.push('\n');
                        }
                        text
                    });
                if let Err(e) = self.send(HostMessage::InputResponse { id, text }) {
                    tracing::warn!(error = %e, "answering input request");
                }
            }
            Event::EvalResult {
                expression,
                repr,
                success,
            } => handler.on_eval_result(&expression, &repr, success),
            Event::InteractiveResult {
                stdout,
                stderr,
                success,
                error,
                ..
            } => match self.pending.take() {
                Some(callback) => callback(InteractiveOutcome {
                    stdout,
                    stderr,
                    success,
                    error,
                }),
                None => tracing::warn!("interactive result without a pending request"),
            },
            Event::BreakpointStatus {
                action,
                file,
                line,
                error,
            } => {
                if action == BreakpointAction::AddFailed {
                    self.breakpoints.retain(|b| !b.matches(&file, line));
                }
                handler.on_breakpoint_status(action, &file, line, error.as_deref());
            }
            Event::Finished => {
                if let Some(session) = self.session.as_mut() {
                    session.finished = true;
                }
                return true;
            }
        }
        false
    }

    /// Release the worker and notify the handler. Safe to call repeatedly.
    fn terminate(&mut self, handler: &mut dyn EventHandler) {
        let Some(session) = self.session.take() else {
            return;
        };
        let ActiveSession {
            mut outbox,
            worker: mut handle,
            finished,
            ..
        } = session;

        if !finished {
            tracing::warn!("worker ended without finishing the session");
        }
        if let Some(callback) = self.pending.take() {
            callback(InteractiveOutcome::failed("debugger session ended"));
        }

        // unblocks a worker waiting for input or commands
        if let Err(e) = outbox.send(HostMessage::Finished) {
            tracing::debug!(error = %e, "worker no longer listening");
        }
        drop(outbox);
        handle.terminate(self.options.join_timeout);

        self.state = ExecutionState::Finished;
        handler.on_finished();
    }

    /// Kill the worker now.
    pub fn stop(&mut self, handler: &mut dyn EventHandler) {
        if let Some(session) = self.session.as_mut() {
            tracing::debug!("stopping worker");
            session.worker.kill();
        }
        self.terminate(handler);
    }

    pub fn step(&mut self) -> eyre::Result<()> {
        self.resume(Command::Step)
    }

    pub fn next(&mut self) -> eyre::Result<()> {
        self.resume(Command::Next)
    }

    pub fn cont(&mut self) -> eyre::Result<()> {
        self.resume(Command::Continue)
    }

    pub fn step_out(&mut self) -> eyre::Result<()> {
        self.resume(Command::Return)
    }

    pub fn quit(&mut self) -> eyre::Result<()> {
        self.resume(Command::Quit)
    }

    pub fn eval(&mut self, expression: impl Into<String>) -> eyre::Result<()> {
        self.ensure_paused()?;
        self.send(HostMessage::Command(Command::Eval {
            expression: expression.into(),
        }))
    }

    /// Run `code` in the paused frame. `callback` receives the captured
    /// output, or a failure if the session ends first.
    pub fn exec_interactive(
        &mut self,
        code: impl Into<String>,
        callback: impl FnOnce(InteractiveOutcome) + 'static,
    ) -> eyre::Result<()> {
        self.ensure_paused()?;
        eyre::ensure!(
            self.pending.is_none(),
            "an interactive command is already running"
        );
        self.send(HostMessage::Command(Command::ExecInteractive {
            code: code.into(),
        }))?;
        self.pending = Some(Box::new(callback));
        Ok(())
    }

    /// Save a breakpoint and arm it in the running worker, if any.
    pub fn add_breakpoint(&mut self, breakpoint: Breakpoint) -> eyre::Result<()> {
        let command = Command::AddBreakpoint {
            file: breakpoint.normalised_path().into_owned(),
            line: breakpoint.line,
        };
        if !self.breakpoints.contains(&breakpoint) {
            self.breakpoints.push(breakpoint);
        }
        if self.session.is_some() {
            self.send(HostMessage::Command(command))?;
        }
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, breakpoint: &Breakpoint) -> eyre::Result<()> {
        self.breakpoints
            .retain(|b| !b.matches(&breakpoint.normalised_path(), breakpoint.line));
        if self.session.is_some() {
            self.send(HostMessage::Command(Command::RemoveBreakpoint {
                file: breakpoint.normalised_path().into_owned(),
                line: breakpoint.line,
            }))?;
        }
        Ok(())
    }

    fn resume(&mut self, command: Command) -> eyre::Result<()> {
        self.ensure_paused()?;
        self.send(HostMessage::Command(command))?;
        self.state = ExecutionState::Running;
        Ok(())
    }

    fn ensure_paused(&self) -> eyre::Result<()> {
        eyre::ensure!(
            self.state == ExecutionState::Paused,
            "the debuggee is not paused (state: {:?})",
            self.state
        );
        Ok(())
    }

    fn send(&mut self, message: HostMessage) -> eyre::Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| eyre::eyre!("no active debugging session"))?;
        tracing::debug!(?message, "sending message");
        session
            .outbox
            .send(message)
            .wrap_err("sending message to worker")
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.worker.kill();
        }
    }
}
