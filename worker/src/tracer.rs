//! The stepping state machine driven by the Lua line hook.
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    rc::Rc,
};

use mlua::{Debug, Function, HookTriggers, Lua, MultiValue, Table, Thread, Value, VmState};
use transport::{
    BreakpointAction, Command, Event, Frame, HostMessage, SerializedValue, SourceBreakpoint,
    WorkerOptions,
};

use crate::{
    breakpoints::BreakpointRegistry,
    inspect::{self, Inspector},
    link::{Interrupt, Link},
    relay::{Relay, Stream},
    snapshot::Snapshotter,
    source::{FrameFilter, Location, SourceMap},
};

/// When the tracer should pause next, besides breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Every line.
    Step,
    /// The next line whose stack depth is at most `depth`.
    Over { depth: usize },
    /// The next line whose stack depth is below `depth`.
    Out { depth: usize },
    /// Breakpoints only.
    Continue,
}

impl StepMode {
    pub fn stops(self, depth: impl FnOnce() -> usize) -> bool {
        match self {
            StepMode::Step => true,
            StepMode::Continue => false,
            StepMode::Over { depth: limit } => depth() <= limit,
            StepMode::Out { depth: limit } => depth() < limit,
        }
    }
}

pub struct Tracer {
    link: Rc<Link>,
    relay: Rc<Relay>,
    registry: RefCell<BreakpointRegistry>,
    sources: RefCell<SourceMap>,
    snapshots: Snapshotter,
    inspector: Inspector,
    mode: Cell<StepMode>,
    /// Set while a pause is blocked on the host.
    paused: Cell<bool>,
    /// Stack depth of the threads that resumed the running coroutine.
    base_depth: Cell<usize>,
    options: WorkerOptions,
    /// Globals that existed before the debuggee started.
    baseline: HashSet<String>,
}

impl Tracer {
    pub fn new(
        lua: &Lua,
        link: Rc<Link>,
        relay: Rc<Relay>,
        options: WorkerOptions,
        baseline: HashSet<String>,
        mode: StepMode,
    ) -> mlua::Result<Self> {
        Ok(Self {
            snapshots: Snapshotter::new(lua, &options)?,
            inspector: Inspector::load(lua)?,
            sources: RefCell::new(SourceMap::new(FrameFilter::from_options(&options))),
            registry: RefCell::new(BreakpointRegistry::new()),
            mode: Cell::new(mode),
            paused: Cell::new(false),
            base_depth: Cell::new(0),
            link,
            relay,
            options,
            baseline,
        })
    }

    /// Arm the initial breakpoints. Only failures are reported.
    pub fn seed(&self, breakpoints: &[SourceBreakpoint]) {
        for breakpoint in breakpoints {
            let status = self.add_breakpoint(breakpoint.file.clone(), breakpoint.line);
            if let Event::BreakpointStatus {
                action: BreakpointAction::AddFailed,
                ..
            } = &status
            {
                self.link.send(status);
            }
        }
    }

    /// Install the line hook on `thread`. Only one thread is hooked at a
    /// time, so the hook follows coroutines as they are resumed.
    pub fn attach(self: &Rc<Self>, thread: &Thread) {
        let tracer = Rc::clone(self);
        thread.set_hook(HookTriggers::new().every_line(), move |lua, debug| {
            tracer.on_line(lua, debug)
        });
    }

    /// Replace `coroutine.resume` and `coroutine.wrap` with versions that
    /// move the hook into the coroutine for as long as it runs.
    pub fn trace_coroutines(self: &Rc<Self>, lua: &Lua) -> mlua::Result<()> {
        let coroutine: Table = lua.globals().get("coroutine")?;
        let resume: Function = coroutine.get("resume")?;
        let tracer = Rc::clone(self);
        let traced = lua.create_function(move |lua, (co, args): (Value, MultiValue)| {
            match co {
                Value::Thread(co) => tracer.resume(lua, &resume, co, args),
                other => resume.call((other, args)),
            }
        })?;

        let wrap: Function = lua
            .load(WRAP)
            .set_name(inspect::CHUNK_NAME)
            .call((
                coroutine.get::<Function>("create")?,
                traced.clone(),
                lua.globals().get::<Function>("error")?,
            ))?;
        coroutine.set("resume", traced)?;
        coroutine.set("wrap", wrap)
    }

    fn resume(
        self: &Rc<Self>,
        lua: &Lua,
        resume: &Function,
        co: Thread,
        args: MultiValue,
    ) -> mlua::Result<MultiValue> {
        if self.paused.get() {
            return resume.call((co, args));
        }

        let resumer = lua.current_thread();
        let outer = self.base_depth.get();
        self.base_depth.set(outer + stack_depth(lua));
        self.attach(&co);
        let result = resume.call::<MultiValue>((co, args));
        self.base_depth.set(outer);
        self.attach(&resumer);

        // a quit or exit inside the coroutine must not stop at its boundary
        if let Some(interrupt) = self.link.interrupted() {
            return Err(interrupt.to_error());
        }
        result
    }

    /// Line hook entry point.
    pub fn on_line(&self, lua: &Lua, debug: Debug<'_>) -> mlua::Result<VmState> {
        if let Some(interrupt) = self.link.interrupted() {
            return Err(interrupt.to_error());
        }
        if self.paused.get() {
            return Ok(VmState::Continue);
        }
        self.apply_deferred();

        let Ok(line) = u32::try_from(debug.curr_line()) else {
            return Ok(VmState::Continue);
        };
        let location = {
            let source = debug.source();
            match source.source.as_deref() {
                Some(source) => self.sources.borrow_mut().resolve(source),
                None => return Ok(VmState::Continue),
            }
        };

        let at_breakpoint = location
            .file
            .as_deref()
            .is_some_and(|file| self.registry.borrow().contains(file, line));
        if !at_breakpoint && !self.mode.get().stops(|| self.depth(lua)) {
            return Ok(VmState::Continue);
        }

        if location.internal {
            // keep stepping until we are back in user code
            self.mode.set(StepMode::Step);
            return Ok(VmState::Continue);
        }

        self.paused.set(true);
        let result = Pause {
            tracer: self,
            lua,
            depth: self.depth(lua),
            location,
            line,
        }
        .run();
        self.paused.set(false);
        result
    }

    /// Depth of the running frame, counting the frames of every thread
    /// waiting on a coroutine resume.
    fn depth(&self, lua: &Lua) -> usize {
        self.base_depth.get() + stack_depth(lua)
    }

    /// Breakpoint edits that arrived while the debuggee was reading input.
    fn apply_deferred(&self) {
        while let Some(command) = self.link.take_deferred() {
            let status = match command {
                Command::AddBreakpoint { file, line } => self.add_breakpoint(file, line),
                Command::RemoveBreakpoint { file, line } => self.remove_breakpoint(file, line),
                other => {
                    tracing::warn!(command = ?other, "dropping deferred command");
                    continue;
                }
            };
            self.link.send(status);
        }
    }

    fn add_breakpoint(&self, file: PathBuf, line: u32) -> Event {
        match self.registry.borrow_mut().set(&file, line) {
            Ok(path) => Event::BreakpointStatus {
                action: BreakpointAction::Added,
                file: path,
                line,
                error: None,
            },
            Err(e) => {
                tracing::warn!(file = %file.display(), line, error = %e, "could not set breakpoint");
                Event::BreakpointStatus {
                    action: BreakpointAction::AddFailed,
                    file,
                    line,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn remove_breakpoint(&self, file: PathBuf, line: u32) -> Event {
        match self.registry.borrow_mut().clear(&file, line) {
            Ok(path) => Event::BreakpointStatus {
                action: BreakpointAction::Removed,
                file: path,
                line,
                error: None,
            },
            Err(e) => Event::BreakpointStatus {
                action: BreakpointAction::RemoveFailed,
                file,
                line,
                error: Some(e.to_string()),
            },
        }
    }

    fn stack_snapshot(&self) -> Vec<Frame> {
        let raw = match self.inspector.stack(self.options.max_stack_depth) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "collecting stack");
                return Vec::new();
            }
        };
        let mut sources = self.sources.borrow_mut();
        let mut frames: Vec<Frame> = raw
            .into_iter()
            .map(|frame| {
                let file = if frame.source.starts_with('@') {
                    sources.resolve(&frame.source).display.clone()
                } else {
                    PathBuf::from(frame.short_src)
                };
                Frame {
                    file,
                    line: frame.line,
                    function: frame.function,
                }
            })
            .collect();
        frames.reverse();
        frames
    }

    fn variables_snapshot(
        &self,
        lua: &Lua,
    ) -> (
        BTreeMap<String, SerializedValue>,
        BTreeMap<String, SerializedValue>,
    ) {
        let locals = self.inspector.locals().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "collecting locals");
            Vec::new()
        });

        let mut globals = Vec::new();
        let collected = lua.globals().for_each(|key: Value, value: Value| {
            let name = match &key {
                Value::String(s) => String::from(s.to_string_lossy()),
                other => self.snapshots.safe_repr(other),
            };
            if !(self.options.hide_builtin_globals && self.baseline.contains(&name)) {
                globals.push((name, value));
            }
            Ok(())
        });
        if let Err(e) = collected {
            tracing::warn!(error = %e, "collecting globals");
        }

        (
            self.snapshots.safe_vars(locals, 0),
            self.snapshots.safe_vars(globals, 0),
        )
    }
}

/// `coroutine.wrap` rebuilt on top of the traced `coroutine.resume`.
const WRAP: &str = r#"
local create, resume, error = ...

local function finish(ok, ...)
  if ok then
    return ...
  end
  error((...), 0)
end

return function(f)
  local co = create(f)
  return function(...)
    return finish(resume(co, ...))
  end
end
"#;

fn stack_depth(lua: &Lua) -> usize {
    let mut level = 0;
    while lua.inspect_stack(level).is_some() {
        level += 1;
    }
    level
}

/// One pause of the debuggee, alive while the tracer blocks for commands.
struct Pause<'a> {
    tracer: &'a Tracer,
    lua: &'a Lua,
    location: Rc<Location>,
    line: u32,
    depth: usize,
}

impl Pause<'_> {
    fn run(self) -> mlua::Result<VmState> {
        self.announce();
        let depth = self.depth;

        loop {
            // a read inside `exec` may have deferred some
            self.tracer.apply_deferred();
            let command = match self.tracer.link.recv() {
                Some(HostMessage::Command(command)) => command,
                Some(HostMessage::InputResponse { id, .. }) => {
                    tracing::warn!(%id, "ignoring input response while paused");
                    continue;
                }
                Some(HostMessage::Launch(_)) => {
                    tracing::warn!("ignoring launch arguments mid session");
                    continue;
                }
                Some(HostMessage::Finished) | None => {
                    tracing::debug!("host went away while paused");
                    Command::Quit
                }
            };

            match command {
                Command::Step => return Ok(self.resume(StepMode::Step)),
                Command::Next => return Ok(self.resume(StepMode::Over { depth })),
                Command::Return => return Ok(self.resume(StepMode::Out { depth })),
                Command::Continue => return Ok(self.resume(StepMode::Continue)),
                Command::Quit => {
                    self.tracer.link.interrupt(Interrupt::Quit);
                    let interrupt = self.tracer.link.interrupted().unwrap_or(Interrupt::Quit);
                    return Err(interrupt.to_error());
                }
                Command::Eval { expression } => self.eval(expression),
                Command::ExecInteractive { code } => self.exec(code),
                Command::AddBreakpoint { file, line } => {
                    let status = self.tracer.add_breakpoint(file, line);
                    self.tracer.link.send(status);
                }
                Command::RemoveBreakpoint { file, line } => {
                    let status = self.tracer.remove_breakpoint(file, line);
                    self.tracer.link.send(status);
                }
            }
        }
    }

    fn announce(&self) {
        let link = &self.tracer.link;
        tracing::debug!(file = %self.location.display.display(), line = self.line, depth = self.depth, "paused");
        link.send(Event::Line {
            file: self.location.display.clone(),
            line: self.line,
        });
        link.send(Event::Stack {
            frames: self.tracer.stack_snapshot(),
        });
        let (locals, globals) = self.tracer.variables_snapshot(self.lua);
        link.send(Event::Variables { locals, globals });
    }

    fn resume(self, mode: StepMode) -> VmState {
        tracing::debug!(?mode, "resuming");
        self.tracer.mode.set(mode);
        VmState::Continue
    }

    fn eval(&self, expression: String) {
        let (repr, success) = match self.tracer.inspector.eval(self.lua, &expression) {
            Ok(values) => (self.tracer.snapshots.repr_all(values.iter()), true),
            Err(e) => (inspect::error_message(&e), false),
        };
        self.tracer.link.send(Event::EvalResult {
            expression,
            repr,
            success,
        });
    }

    fn exec(&self, code: String) {
        let relay = &self.tracer.relay;
        relay.begin_capture();
        let error = match self.tracer.inspector.exec(self.lua, &code) {
            Ok(Some(values)) if !values.is_empty() => {
                let echo = self.tracer.snapshots.repr_all(values.iter());
                relay.write(Stream::Out, &format!("{echo}\n"));
                None
            }
            Ok(_) => None,
            Err(e) => {
                relay.write(Stream::Err, &format!("{}\n", inspect::error_report(&e)));
                Some(inspect::error_message(&e))
            }
        };
        let captured = relay.end_capture();

        self.tracer.link.send(Event::InteractiveResult {
            code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            success: error.is_none(),
            error,
        });
    }
}
