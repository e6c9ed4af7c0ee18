use std::{
    collections::VecDeque,
    io::Write,
    path::{Path, PathBuf},
    thread::JoinHandle,
    time::Duration,
};

use color_eyre::eyre::{self, Context};
use crossbeam_channel::Receiver;
use debugger::{Breakpoint, Controller, EventHandler, ExecutionState, OutputStream, Scope};
use transport::{BreakpointAction, Frame};

use crate::command::{ReplCommand, Target, HELP};

const PROMPT: &str = "(luadbg) ";

/// Renders worker events on the terminal.
struct Console {
    input_rx: Receiver<Option<String>>,
    /// Lines typed while the debuggee was running, kept for its next read.
    typeahead: VecDeque<String>,
    frames: Vec<Frame>,
    locals: Scope,
    globals: Scope,
    finished: bool,
    poll_interval: Duration,
}

impl Console {
    fn prompt(&self) {
        print!("{PROMPT}");
        let _ = std::io::stdout().flush();
    }
}

impl EventHandler for Console {
    fn on_line(&mut self, file: &Path, line: u32) {
        println!("paused at {}:{line}", file.display());
    }

    fn on_stack(&mut self, frames: &[Frame]) {
        self.frames = frames.to_vec();
    }

    fn on_variables(&mut self, locals: &Scope, globals: &Scope) {
        self.locals = locals.clone();
        self.globals = globals.clone();
        self.prompt();
    }

    fn on_output(&mut self, stream: OutputStream, text: &str) {
        match stream {
            OutputStream::Stdout => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            OutputStream::Stderr => {
                eprint!("{text}");
            }
        }
    }

    fn on_input_request(
        &mut self,
        _prompt: &str,
        worker_alive: &mut dyn FnMut() -> bool,
    ) -> Option<String> {
        // the prompt itself was already printed as program output
        if let Some(line) = self.typeahead.pop_front() {
            return Some(line);
        }
        loop {
            crossbeam_channel::select! {
                recv(self.input_rx) -> input => return match input {
                    Ok(Some(line)) if !line.is_empty() => Some(line),
                    _ => None,
                },
                default(self.poll_interval) => {
                    if !worker_alive() {
                        tracing::debug!("worker exited while waiting for input");
                        return None;
                    }
                }
            }
        }
    }

    fn on_eval_result(&mut self, _expression: &str, repr: &str, success: bool) {
        if success {
            println!("{repr}");
        } else {
            println!("error: {repr}");
        }
        self.prompt();
    }

    fn on_breakpoint_status(
        &mut self,
        action: BreakpointAction,
        file: &Path,
        line: u32,
        error: Option<&str>,
    ) {
        let location = format!("{}:{line}", file.display());
        match action {
            BreakpointAction::Added => println!("breakpoint set at {location}"),
            BreakpointAction::Removed => println!("breakpoint removed from {location}"),
            BreakpointAction::AddFailed | BreakpointAction::RemoveFailed => println!(
                "breakpoint {location} failed: {}",
                error.unwrap_or("unknown error")
            ),
        }
    }

    fn on_finished(&mut self) {
        println!("program finished");
        self.finished = true;
    }
}

pub enum ShouldQuit {
    True,
    False,
}

pub struct App {
    controller: Controller,
    console: Console,
    script: PathBuf,
    input_rx: Receiver<Option<String>>,
    poll_interval: Duration,

    #[allow(dead_code)]
    input_thread: JoinHandle<()>,
}

impl App {
    pub fn new(controller: Controller, script: PathBuf, poll_interval: Duration) -> Self {
        // handle input; `None` marks the end of stdin
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let input_thread = std::thread::spawn(move || {
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match std::io::stdin().read_line(&mut buffer) {
                    Ok(0) => {
                        let _ = input_tx.send(None);
                        return;
                    }
                    Ok(_) => {
                        let line = buffer.trim_end_matches(['\r', '\n']).to_owned();
                        if input_tx.send(Some(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reading from stdin");
                        let _ = input_tx.send(None);
                        return;
                    }
                }
            }
        });

        Self {
            console: Console {
                input_rx: input_rx.clone(),
                typeahead: VecDeque::new(),
                frames: Vec::new(),
                locals: Scope::new(),
                globals: Scope::new(),
                finished: false,
                poll_interval,
            },
            controller,
            script,
            input_rx,
            poll_interval,
            input_thread,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn run(&mut self) -> eyre::Result<()> {
        loop {
            match self.loop_step() {
                Ok(ShouldQuit::True) => break,
                Ok(ShouldQuit::False) => {}
                Err(e) => eyre::bail!("Error running command: {e}"),
            }
        }
        Ok(())
    }

    fn loop_step(&mut self) -> eyre::Result<ShouldQuit> {
        crossbeam_channel::select! {
            recv(self.input_rx) -> input => match input {
                Ok(Some(line)) => self.handle_input(&line),
                Ok(None) | Err(_) => {
                    tracing::debug!("end of input, stopping");
                    self.controller.stop(&mut self.console);
                    return Ok(ShouldQuit::True);
                }
            },
            default(self.poll_interval) => {}
        }

        self.controller.poll(&mut self.console);
        if self.console.finished {
            return Ok(ShouldQuit::True);
        }
        Ok(ShouldQuit::False)
    }

    fn handle_input(&mut self, input: &str) {
        let command: ReplCommand = match input.parse() {
            Ok(command) => command,
            Err(_) if self.controller.state() == ExecutionState::Running => {
                tracing::debug!(input, "queueing input for the debuggee");
                self.console.typeahead.push_back(input.to_string());
                return;
            }
            Err(e) => {
                println!("{e}");
                self.reprompt();
                return;
            }
        };
        if let Err(e) = self.handle_command(command) {
            println!("error: {e:#}");
            self.reprompt();
        }
    }

    fn reprompt(&self) {
        if self.controller.state() == ExecutionState::Paused {
            self.console.prompt();
        }
    }

    #[tracing::instrument(skip(self))]
    fn handle_command(&mut self, command: ReplCommand) -> eyre::Result<()> {
        match command {
            ReplCommand::Empty => self.reprompt(),
            ReplCommand::Help => {
                println!("{HELP}");
                self.reprompt();
            }
            ReplCommand::Step => self.controller.step().context("stepping")?,
            ReplCommand::Next => self.controller.next().context("stepping over")?,
            ReplCommand::Continue => self.controller.cont().context("continuing")?,
            ReplCommand::Return => self.controller.step_out().context("stepping out")?,
            ReplCommand::Quit => {
                if self.controller.state() == ExecutionState::Paused {
                    self.controller.quit().context("quitting")?;
                } else {
                    self.controller.stop(&mut self.console);
                }
            }
            ReplCommand::Stop => self.controller.stop(&mut self.console),
            ReplCommand::Print(expression) => self.controller.eval(expression)?,
            ReplCommand::Exec(code) => {
                self.controller.exec_interactive(code, |outcome| {
                    print!("{}", outcome.stdout);
                    eprint!("{}", outcome.stderr);
                    if let Some(error) = outcome.error {
                        println!("error: {error}");
                    }
                    print!("{PROMPT}");
                    let _ = std::io::stdout().flush();
                })?;
            }
            ReplCommand::Break(target) => {
                let breakpoint = self.resolve(target)?;
                self.controller
                    .add_breakpoint(breakpoint.clone())
                    .context("adding breakpoint")?;
                if !self.controller.is_active() {
                    println!("breakpoint saved at {breakpoint}");
                }
                self.reprompt();
            }
            ReplCommand::Delete(target) => {
                let breakpoint = self.resolve(target)?;
                self.controller
                    .remove_breakpoint(&breakpoint)
                    .context("removing breakpoint")?;
                self.reprompt();
            }
            ReplCommand::Backtrace => {
                for (depth, frame) in self.console.frames.iter().rev().enumerate() {
                    println!("#{depth} {frame}");
                }
                self.reprompt();
            }
            ReplCommand::Vars => {
                print_scope("locals", &self.console.locals);
                print_scope("globals", &self.console.globals);
                self.reprompt();
            }
            ReplCommand::Breakpoints => {
                for breakpoint in self.controller.breakpoints() {
                    println!("{breakpoint}");
                }
                self.reprompt();
            }
        }
        Ok(())
    }

    fn resolve(&self, target: Target) -> eyre::Result<Breakpoint> {
        match target {
            Target::Line(line) => Ok(Breakpoint::new(self.script.clone(), line)),
            Target::Spec(spec) => spec.parse(),
        }
    }
}

fn print_scope(title: &str, scope: &Scope) {
    println!("{title}:");
    for (name, value) in scope {
        println!("  {name} = {value}");
    }
}
