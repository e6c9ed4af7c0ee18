//! Spawning and supervising the worker process.
use std::{
    io::{BufReader, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use eyre::WrapErr;
use transport::{Event, FrameReader, FrameWriter, HostMessage, LaunchArguments, Outbox};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Control over whatever runs the debuggee.
pub trait WorkerHandle {
    fn id(&self) -> Option<u32>;

    fn has_exited(&mut self) -> bool;

    /// Forcefully stop the worker.
    fn kill(&mut self);

    /// Wait up to `timeout` for the worker to exit on its own, then kill it.
    fn terminate(&mut self, timeout: Duration);
}

/// The host's end of a freshly launched session.
pub struct Connection {
    pub outbox: Box<dyn Outbox<HostMessage>>,
    pub events: Receiver<Event>,
    pub worker: Box<dyn WorkerHandle>,
}

/// Starts a worker for a session. The launch arguments must be delivered as
/// the first message.
pub trait Launcher {
    fn launch(&mut self, arguments: LaunchArguments) -> eyre::Result<Connection>;
}

/// Program and arguments that start a worker speaking the framed protocol
/// on its stdio.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running executable's hidden `worker` subcommand.
    pub fn current_exe() -> eyre::Result<Self> {
        let program = std::env::current_exe().context("locating current executable")?;
        Ok(Self {
            program,
            args: vec!["worker".to_string()],
        })
    }
}

pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl Launcher for ProcessLauncher {
    #[tracing::instrument(skip(self, arguments), fields(program = %self.command.program.display()))]
    fn launch(&mut self, arguments: LaunchArguments) -> eyre::Result<Connection> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .wrap_err_with(|| {
                format!(
                    "spawning worker process {}",
                    self.command.program.display()
                )
            })?;
        tracing::debug!(pid = child.id(), "worker spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre::eyre!("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre::eyre!("worker stdout was not captured"))?;
        let mut worker = WorkerProcess { child };

        let mut writer = FrameWriter::new(stdin);
        if let Err(e) = writer.send(&HostMessage::Launch(arguments)) {
            worker.kill();
            return Err(e).wrap_err("sending launch arguments");
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("worker-events".to_string())
            .spawn(move || forward_events(stdout, tx))
            .wrap_err("spawning event reader thread")?;

        Ok(Connection {
            outbox: Box::new(writer),
            events: rx,
            worker: Box::new(worker),
        })
    }
}

/// Decode frames from the worker until it closes its stdout. A corrupt
/// stream is reported to the user as worker stderr.
fn forward_events(stdout: impl Read, tx: Sender<Event>) {
    let mut reader = FrameReader::new(BufReader::new(stdout));
    loop {
        match reader.poll_message::<Event>() {
            Ok(Some(event)) => {
                tracing::trace!(?event, "received event");
                if tx.send(event).is_err() {
                    tracing::debug!("controller gone, stopping event reader");
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("worker closed its output");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reading from worker");
                let _ = tx.send(Event::StdErr {
                    text: format!("lost connection to the worker: {e}\n"),
                });
                break;
            }
        }
    }
}

/// A worker child process. Killed on drop if still running.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerHandle for WorkerProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "worker exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "checking worker status");
                true
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "killing worker");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(error = %e, "reaping worker");
        }
    }

    fn terminate(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_exited() {
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        tracing::warn!(?timeout, "worker did not exit in time, killing");
        self.kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sleeper() -> WorkerProcess {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        WorkerProcess { child }
    }

    #[test]
    fn terminate_kills_after_timeout() {
        let mut worker = sleeper();
        assert!(!worker.has_exited());

        let started = Instant::now();
        worker.terminate(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(worker.has_exited());
    }

    #[test]
    fn corrupt_stream_is_reported() {
        let mut stream = transport::encode(&Event::StdOut {
            text: "hi\n".to_string(),
        })
        .unwrap();
        stream.extend_from_slice(b"hi\nContent-Length: 2\r\n\r\n{}");

        let (tx, rx) = crossbeam_channel::unbounded();
        forward_events(std::io::Cursor::new(stream), tx);

        let events: Vec<Event> = rx.iter().collect();
        assert_eq!(events.len(), 2, "{events:?}");
        assert_eq!(
            events[0],
            Event::StdOut {
                text: "hi\n".to_string()
            }
        );
        assert!(
            matches!(&events[1], Event::StdErr { text } if text.starts_with("lost connection to the worker")),
            "{events:?}"
        );
    }

    #[test]
    fn clean_end_of_stream_is_silent() {
        let stream = transport::encode(&Event::Finished).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        forward_events(std::io::Cursor::new(stream), tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![Event::Finished]);
    }

    #[test]
    fn launch_failure_is_an_error() {
        let mut launcher = ProcessLauncher::new(WorkerCommand {
            program: PathBuf::from("/does/not/exist/luadbg"),
            args: Vec::new(),
        });
        let err = launcher
            .launch(LaunchArguments::new("script.lua"))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("spawning worker process"));
    }
}
