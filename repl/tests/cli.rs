use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal::Signal, unistd::Pid};

const TIMEOUT: Duration = Duration::from_secs(20);

/// Shared buffer filled by a reader thread.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<String>>);

impl Captured {
    fn follow(&self, mut stream: impl Read + Send + 'static) {
        let buffer = self.0.clone();
        thread::spawn(move || {
            let mut chunk = [0u8; 1024];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buffer
                        .lock()
                        .unwrap()
                        .push_str(&String::from_utf8_lossy(&chunk[..n])),
                }
            }
        });
    }

    fn text(&self) -> String {
        self.0.lock().unwrap().clone()
    }
}

struct Luadbg {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Captured,
    stderr: Captured,
    cursor: usize,
}

impl Luadbg {
    fn spawn(dir: &Path, args: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_luadbg"))
            .arg("--config")
            .arg(dir.join("config.toml"))
            .arg("--state")
            .arg(dir.join("state.json"))
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let stdout = Captured::default();
        stdout.follow(child.stdout.take().unwrap());
        let stderr = Captured::default();
        stderr.follow(child.stderr.take().unwrap());

        Self {
            stdin: child.stdin.take(),
            child,
            stdout,
            stderr,
            cursor: 0,
        }
    }

    fn send(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().unwrap();
        writeln!(stdin, "{line}").unwrap();
        stdin.flush().unwrap();
    }

    /// Wait until `needle` appears on stdout after everything already
    /// matched, returning the text up to and including it.
    fn expect(&mut self, needle: &str) -> String {
        let started = Instant::now();
        loop {
            let text = self.stdout.text();
            if let Some(offset) = text[self.cursor..].find(needle) {
                let end = self.cursor + offset + needle.len();
                let seen = text[self.cursor..end].to_string();
                self.cursor = end;
                return seen;
            }
            if started.elapsed() > TIMEOUT {
                panic!(
                    "timed out waiting for {needle:?}\nstdout:\n{text}\nstderr:\n{}",
                    self.stderr.text()
                );
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn worker_pid(&mut self) -> i32 {
        let line = self.expect(")\n");
        let (_, rest) = line.rsplit_once("worker pid ").unwrap();
        rest.trim_end_matches(")\n").parse().unwrap()
    }

    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    fn wait(mut self) -> ExitStatus {
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if started.elapsed() > TIMEOUT {
                let _ = self.child.kill();
                panic!(
                    "luadbg did not exit\nstdout:\n{}\nstderr:\n{}",
                    self.stdout.text(),
                    self.stderr.text()
                );
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn write_script(dir: &Path, source: &str) -> PathBuf {
    let path = dir.join("script.lua");
    std::fs::write(&path, source).unwrap();
    path
}

fn workspace() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    (dir, root)
}

const ADDITION: &str = "local a = 2\nlocal b = 3\nprint(a + b)\n";

#[test]
fn breakpoint_eval_and_continue() {
    let (_dir, root) = workspace();
    let script = write_script(&root, ADDITION);
    let breakpoint = format!("{}:2", script.display());

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap(), "-b", &breakpoint]);
    luadbg.expect(&format!("paused at {}:2", script.display()));
    luadbg.expect("(luadbg) ");

    luadbg.send("p a * 10");
    luadbg.expect("20\n");
    luadbg.send("p 1//0");
    luadbg.expect("error:");
    luadbg.send("c");
    luadbg.expect("5\n");
    luadbg.expect("program finished");

    assert!(luadbg.wait().success());
}

#[test]
fn typed_lines_feed_io_read() {
    let (_dir, root) = workspace();
    let script = write_script(&root, "local name = io.read()\nprint('hello ' .. name)\n");

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap()]);
    luadbg.expect("debugging");
    luadbg.send("bob");
    luadbg.expect("hello bob\n");
    luadbg.expect("program finished");

    assert!(luadbg.wait().success());
}

#[test]
fn breakpoints_and_arguments_are_remembered() {
    let (_dir, root) = workspace();
    let script = write_script(&root, "local first = ...\nprint(first)\n");
    let breakpoint = format!("{}:2", script.display());

    let mut luadbg = Luadbg::spawn(
        &root,
        &[
            "debug",
            script.to_str().unwrap(),
            "-b",
            &breakpoint,
            "--",
            "remembered",
        ],
    );
    luadbg.expect("paused at");
    luadbg.expect("(luadbg) ");
    luadbg.send("q");
    luadbg.expect("program finished");
    assert!(luadbg.wait().success());

    let state = std::fs::read_to_string(root.join("state.json")).unwrap();
    assert!(state.contains("remembered"), "{state}");

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap()]);
    luadbg.expect(&format!("paused at {}:2", script.display()));
    luadbg.expect("(luadbg) ");
    luadbg.send("c");
    luadbg.expect("remembered\n");
    luadbg.expect("program finished");
    assert!(luadbg.wait().success());
}

#[test]
fn killed_worker_ends_the_session() {
    let (_dir, root) = workspace();
    let script = write_script(&root, ADDITION);
    let breakpoint = format!("{}:1", script.display());

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap(), "-b", &breakpoint]);
    let pid = luadbg.worker_pid();
    luadbg.expect("(luadbg) ");

    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    luadbg.expect("program finished");

    assert!(luadbg.wait().success());
}

#[test]
fn worker_killed_during_a_read_ends_the_session() {
    let (_dir, root) = workspace();
    let script = write_script(&root, "io.write('name? ')\nlocal n = io.read()\nprint(n)\n");

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap()]);
    let pid = luadbg.worker_pid();
    luadbg.expect("name? ");
    thread::sleep(Duration::from_millis(200));

    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    luadbg.expect("program finished");

    assert!(luadbg.wait().success());
}

#[test]
fn child_process_output_does_not_break_the_session() {
    let (_dir, root) = workspace();
    let script = write_script(&root, "os.execute('echo hi')\nlocal a = 2\nprint('after ' .. a)\n");
    let breakpoint = format!("{}:3", script.display());

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap(), "-b", &breakpoint]);
    luadbg.expect(&format!("paused at {}:3", script.display()));
    luadbg.expect("(luadbg) ");
    luadbg.send("p a");
    luadbg.expect("2\n");
    luadbg.send("c");
    luadbg.expect("after 2\n");
    luadbg.expect("program finished");

    let stderr = luadbg.stderr.clone();
    assert!(luadbg.wait().success());
    assert!(stderr.text().contains("hi\n"), "{}", stderr.text());
    assert!(!stderr.text().contains("lost connection"), "{}", stderr.text());
}

#[test]
fn end_of_input_stops_the_debugger() {
    let (_dir, root) = workspace();
    let script = write_script(&root, ADDITION);
    let breakpoint = format!("{}:1", script.display());

    let mut luadbg = Luadbg::spawn(&root, &["debug", script.to_str().unwrap(), "-b", &breakpoint]);
    luadbg.expect("(luadbg) ");
    luadbg.close_stdin();
    luadbg.expect("program finished");

    assert!(luadbg.wait().success());
}

#[test]
fn missing_script_is_an_error() {
    let (_dir, root) = workspace();
    let missing = root.join("missing.lua");

    let luadbg = Luadbg::spawn(&root, &["debug", missing.to_str().unwrap()]);
    let stderr = luadbg.stderr.clone();
    let status = luadbg.wait();
    assert!(!status.success());

    let started = Instant::now();
    while !stderr.text().contains("opening script") {
        assert!(started.elapsed() < TIMEOUT, "{}", stderr.text());
        thread::sleep(Duration::from_millis(10));
    }
}
