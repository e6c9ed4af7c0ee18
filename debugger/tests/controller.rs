use std::{
    cell::RefCell,
    collections::VecDeque,
    io::IsTerminal,
    path::{Path, PathBuf},
    rc::Rc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use debugger::{
    Breakpoint, Connection, Controller, ControllerOptions, EventHandler, ExecutionState,
    InteractiveOutcome, LaunchRequest, Launcher, OutputStream, Scope, WorkerHandle,
};
use tracing_subscriber::EnvFilter;
use transport::{memory_pair, BreakpointAction, Event, Frame, HostMessage, LaunchArguments};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the worker on a thread of the test process.
struct ThreadLauncher;

impl Launcher for ThreadLauncher {
    fn launch(&mut self, arguments: LaunchArguments) -> eyre::Result<Connection> {
        let (host, worker_end) = memory_pair::<HostMessage, Event>();
        let handle = std::thread::spawn(move || worker::run(Box::new(worker_end)).map(|_| ()));
        let (tx, rx) = host.into_parts();
        tx.send(HostMessage::Launch(arguments))?;
        Ok(Connection {
            outbox: Box::new(tx),
            events: rx,
            worker: Box::new(ThreadWorker {
                handle: Some(handle),
            }),
        })
    }
}

struct ThreadWorker {
    handle: Option<JoinHandle<eyre::Result<()>>>,
}

impl WorkerHandle for ThreadWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    // threads cannot be killed; closing the channel makes the worker quit
    fn kill(&mut self) {}

    fn terminate(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.has_exited() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.has_exited() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// A worker that dies before saying anything.
struct VanishingLauncher;

impl Launcher for VanishingLauncher {
    fn launch(&mut self, _arguments: LaunchArguments) -> eyre::Result<Connection> {
        let (tx, rx) = crossbeam_channel::unbounded::<Event>();
        drop(tx);
        let (outbox, _) = crossbeam_channel::unbounded::<HostMessage>();
        Ok(Connection {
            outbox: Box::new(outbox),
            events: rx,
            worker: Box::new(ThreadWorker { handle: None }),
        })
    }
}

/// A worker that asks for input, then dies without waiting for the answer.
struct DyingReaderLauncher;

impl Launcher for DyingReaderLauncher {
    fn launch(&mut self, _arguments: LaunchArguments) -> eyre::Result<Connection> {
        let (tx, rx) = crossbeam_channel::unbounded::<Event>();
        tx.send(Event::InputRequest {
            id: "read-1".to_string(),
            prompt: "? ".to_string(),
        })?;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(tx);
            Ok(())
        });
        let (outbox, _) = crossbeam_channel::unbounded::<HostMessage>();
        Ok(Connection {
            outbox: Box::new(outbox),
            events: rx,
            worker: Box::new(ThreadWorker {
                handle: Some(handle),
            }),
        })
    }
}

#[derive(Default)]
struct Recorder {
    lines: Vec<(PathBuf, u32)>,
    stacks: Vec<Vec<Frame>>,
    locals: Vec<Scope>,
    stdout: String,
    stderr: String,
    inputs: VecDeque<Option<String>>,
    prompts: Vec<String>,
    evals: Vec<(String, String, bool)>,
    statuses: Vec<(BreakpointAction, u32)>,
    finished: usize,
}

impl EventHandler for Recorder {
    fn on_line(&mut self, file: &Path, line: u32) {
        self.lines.push((file.to_path_buf(), line));
    }

    fn on_stack(&mut self, frames: &[Frame]) {
        self.stacks.push(frames.to_vec());
    }

    fn on_variables(&mut self, locals: &Scope, _globals: &Scope) {
        self.locals.push(locals.clone());
    }

    fn on_output(&mut self, stream: OutputStream, text: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.push_str(text),
            OutputStream::Stderr => self.stderr.push_str(text),
        }
    }

    fn on_input_request(
        &mut self,
        prompt: &str,
        _worker_alive: &mut dyn FnMut() -> bool,
    ) -> Option<String> {
        self.prompts.push(prompt.to_string());
        self.inputs.pop_front().flatten()
    }

    fn on_eval_result(&mut self, expression: &str, repr: &str, success: bool) {
        self.evals
            .push((expression.to_string(), repr.to_string(), success));
    }

    fn on_breakpoint_status(
        &mut self,
        action: BreakpointAction,
        _file: &Path,
        line: u32,
        _error: Option<&str>,
    ) {
        self.statuses.push((action, line));
    }

    fn on_finished(&mut self) {
        self.finished += 1;
    }
}

struct Fixture {
    controller: Controller,
    recorder: Recorder,
    script: PathBuf,
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new(source: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.lua");
        std::fs::write(&script, source).unwrap();
        Self {
            controller: Controller::new(Box::new(ThreadLauncher), ControllerOptions::default()),
            recorder: Recorder::default(),
            script,
            _dir: dir,
        }
    }

    fn breakpoint(&self, line: u32) -> Breakpoint {
        Breakpoint::new(&self.script, line)
    }

    fn launch(&mut self, stop_on_entry: bool) {
        let mut request = LaunchRequest::new(&self.script);
        request.stop_on_entry = stop_on_entry;
        self.controller.launch(request).unwrap();
    }

    fn poll_until(&mut self, done: impl Fn(&Controller, &Recorder) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            self.controller.poll(&mut self.recorder);
            if done(&self.controller, &self.recorder) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for the controller");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_pause(&mut self) -> u32 {
        let seen = self.recorder.lines.len();
        self.poll_until(|c, r| c.state() == ExecutionState::Paused && r.lines.len() > seen);
        // the snapshot follows the line event
        self.poll_until(|_, r| r.locals.len() > seen);
        self.recorder.lines[seen].1
    }

    fn wait_for_finish(&mut self) {
        self.poll_until(|c, _| c.state() == ExecutionState::Finished);
    }
}

#[test]
fn breakpoint_pause_then_run_to_completion() {
    let mut fixture = Fixture::new("local a = 1\nlocal b = 2\nprint(a + b)\n");
    let breakpoint = fixture.breakpoint(3);
    fixture.controller.set_breakpoints(vec![breakpoint]);
    assert_eq!(fixture.controller.state(), ExecutionState::NotStarted);

    fixture.launch(false);
    assert_eq!(fixture.controller.state(), ExecutionState::Running);
    assert_eq!(fixture.wait_for_pause(), 3);
    assert_eq!(fixture.recorder.stacks[0].len(), 1);

    fixture.controller.cont().unwrap();
    assert_eq!(fixture.controller.state(), ExecutionState::Running);
    fixture.wait_for_finish();

    assert_eq!(fixture.recorder.stdout, "3\n");
    assert_eq!(fixture.recorder.finished, 1);
    assert!(!fixture.controller.is_active());

    // nothing left to dispatch
    fixture.controller.poll(&mut fixture.recorder);
    assert_eq!(fixture.recorder.finished, 1);
}

#[test]
fn commands_require_a_paused_debuggee() {
    let mut fixture = Fixture::new("local a = 1\n");
    assert!(fixture.controller.step().is_err());
    assert!(fixture.controller.eval("a").is_err());

    fixture.launch(false);
    assert!(fixture.controller.next().is_err());
    assert!(fixture.controller.exec_interactive("a = 2", |_| {}).is_err());

    fixture.wait_for_finish();
    assert!(fixture.controller.cont().is_err());
}

#[test]
fn launching_twice_is_an_error() {
    let mut fixture = Fixture::new("local a = 1\nlocal b = 2\n");
    fixture.launch(true);
    let err = fixture
        .controller
        .launch(LaunchRequest::new(&fixture.script))
        .unwrap_err();
    assert!(err.to_string().contains("already active"));

    fixture.wait_for_pause();
    fixture.controller.quit().unwrap();
    fixture.wait_for_finish();

    // a finished session can be relaunched
    fixture.launch(true);
    assert_eq!(fixture.wait_for_pause(), 1);
    fixture.controller.cont().unwrap();
    fixture.wait_for_finish();
    assert_eq!(fixture.recorder.finished, 2);
}

#[test]
fn stepping_commands() {
    let source = "\
local function add(a, b)
  local sum = a + b
  return sum
end
local r = add(1, 2)
r = r + 1
print(r)
";
    let mut fixture = Fixture::new(source);
    let breakpoint = fixture.breakpoint(5);
    fixture.controller.set_breakpoints(vec![breakpoint]);
    fixture.launch(false);
    assert_eq!(fixture.wait_for_pause(), 5);

    fixture.controller.step().unwrap();
    assert_eq!(fixture.wait_for_pause(), 2);

    fixture.controller.step_out().unwrap();
    assert_eq!(fixture.wait_for_pause(), 6);

    fixture.controller.next().unwrap();
    assert_eq!(fixture.wait_for_pause(), 7);

    fixture.controller.cont().unwrap();
    fixture.wait_for_finish();
    assert_eq!(fixture.recorder.stdout, "4\n");
}

#[test]
fn eval_and_interactive_results() {
    let mut fixture = Fixture::new("local v = 21\nprint(v)\n");
    let breakpoint = fixture.breakpoint(2);
    fixture.controller.set_breakpoints(vec![breakpoint]);
    fixture.launch(false);
    fixture.wait_for_pause();

    fixture.controller.eval("v + 1").unwrap();
    fixture.controller.eval("1//0").unwrap();
    fixture.poll_until(|_, r| r.evals.len() == 2);
    assert_eq!(
        fixture.recorder.evals[0],
        ("v + 1".to_string(), "22".to_string(), true)
    );
    assert!(!fixture.recorder.evals[1].2);

    let result: Rc<RefCell<Option<InteractiveOutcome>>> = Rc::default();
    let slot = Rc::clone(&result);
    fixture
        .controller
        .exec_interactive("print('side') v = v * 2", move |outcome| {
            *slot.borrow_mut() = Some(outcome);
        })
        .unwrap();
    assert!(fixture
        .controller
        .exec_interactive("print(1)", |_| {})
        .is_err());

    let deadline = Instant::now() + TIMEOUT;
    while result.borrow().is_none() {
        assert!(Instant::now() < deadline);
        fixture.controller.poll(&mut fixture.recorder);
        std::thread::sleep(Duration::from_millis(5));
    }
    let outcome = result.borrow_mut().take().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.stdout, "side\n");

    fixture.controller.cont().unwrap();
    fixture.wait_for_finish();
    assert_eq!(fixture.recorder.stdout, "42\n");
}

#[test]
fn pending_interactive_request_fails_when_the_session_ends() {
    let mut fixture = Fixture::new("local v = 1\nprint(v)\n");
    fixture.launch(true);
    fixture.wait_for_pause();

    let result: Rc<RefCell<Option<InteractiveOutcome>>> = Rc::default();
    let slot = Rc::clone(&result);
    fixture
        .controller
        .exec_interactive("v = 2", move |outcome| {
            *slot.borrow_mut() = Some(outcome);
        })
        .unwrap();
    fixture.controller.stop(&mut fixture.recorder);

    let outcome = result.borrow_mut().take().unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("debugger session ended"));
    assert_eq!(fixture.controller.state(), ExecutionState::Finished);
    assert_eq!(fixture.recorder.finished, 1);

    fixture.controller.stop(&mut fixture.recorder);
    assert_eq!(fixture.recorder.finished, 1);
}

#[test]
fn input_requests_are_answered_by_the_handler() {
    let mut fixture = Fixture::new(
        "io.write('name? ')\nlocal n = io.read()\nlocal m = io.read()\nprint(n, m)\n",
    );
    fixture.recorder.inputs = VecDeque::from([Some("bob".to_string()), None]);
    fixture.launch(false);
    fixture.wait_for_finish();

    assert_eq!(fixture.recorder.prompts, vec!["name? ".to_string(), String::new()]);
    assert_eq!(fixture.recorder.stdout, "name? bob\tnil\n");
}

#[test]
fn breakpoints_added_at_runtime_and_failed_ones_dropped() {
    let source = "local total = 0\nfor i = 1, 3 do\n  total = total + i\nend\nprint(total)\n";
    let mut fixture = Fixture::new(source);
    let missing = fixture.breakpoint(99);
    fixture.controller.set_breakpoints(vec![missing]);
    fixture.launch(true);
    fixture.wait_for_pause();

    assert_eq!(
        fixture.recorder.statuses,
        vec![(BreakpointAction::AddFailed, 99)]
    );
    assert!(fixture.controller.breakpoints().is_empty());

    let breakpoint = fixture.breakpoint(3);
    fixture.controller.add_breakpoint(breakpoint.clone()).unwrap();
    fixture.controller.cont().unwrap();
    assert_eq!(fixture.wait_for_pause(), 3);
    assert_eq!(fixture.recorder.statuses[1], (BreakpointAction::Added, 3));
    assert_eq!(fixture.controller.breakpoints(), &[breakpoint.clone()]);

    fixture.controller.remove_breakpoint(&breakpoint).unwrap();
    fixture.controller.cont().unwrap();
    fixture.wait_for_finish();
    assert_eq!(fixture.recorder.statuses[2], (BreakpointAction::Removed, 3));
    assert!(fixture.controller.breakpoints().is_empty());
    assert_eq!(fixture.recorder.stdout, "6\n");
}

#[test]
fn unhandled_errors_reach_stderr() {
    let mut fixture = Fixture::new("error('kaboom')\n");
    fixture.launch(false);
    fixture.wait_for_finish();
    assert!(fixture
        .recorder
        .stderr
        .starts_with("Unhandled error in debuggee:\n"));
    assert!(fixture.recorder.stderr.contains("kaboom"));
    assert_eq!(fixture.recorder.finished, 1);
}

#[test]
fn vanished_worker_still_finishes() {
    let mut controller = Controller::new(Box::new(VanishingLauncher), ControllerOptions::default());
    let mut recorder = Recorder::default();
    controller.launch(LaunchRequest::new("main.lua")).unwrap();

    controller.poll(&mut recorder);
    assert_eq!(controller.state(), ExecutionState::Finished);
    assert_eq!(recorder.finished, 1);
    assert!(controller.worker_pid().is_none());
}

/// Waits for a user who never types anything.
#[derive(Default)]
struct SilentUser {
    gave_up: bool,
    finished: usize,
}

impl EventHandler for SilentUser {
    fn on_input_request(
        &mut self,
        _prompt: &str,
        worker_alive: &mut dyn FnMut() -> bool,
    ) -> Option<String> {
        let deadline = Instant::now() + TIMEOUT;
        while worker_alive() {
            assert!(Instant::now() < deadline, "worker never exited");
            std::thread::sleep(Duration::from_millis(5));
        }
        self.gave_up = true;
        None
    }

    fn on_finished(&mut self) {
        self.finished += 1;
    }
}

#[test]
fn input_wait_ends_when_the_worker_dies() {
    let mut controller =
        Controller::new(Box::new(DyingReaderLauncher), ControllerOptions::default());
    let mut user = SilentUser::default();
    controller.launch(LaunchRequest::new("main.lua")).unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while controller.state() != ExecutionState::Finished {
        assert!(Instant::now() < deadline, "timed out waiting for the controller");
        controller.poll(&mut user);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(user.gave_up);
    assert_eq!(user.finished, 1);
}

#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}
