//! The debuggee side of a session.
//!
//! A worker reads [`HostMessage::Launch`] as its first message, runs the
//! target script under the line tracer and always closes the session with
//! [`Event::Finished`].
use std::{fs::File, io::BufWriter, os::fd::OwnedFd, rc::Rc};

use eyre::WrapErr;
use transport::{Event, HostMessage, StreamDuplex};

mod breakpoints;
mod inspect;
mod link;
mod relay;
mod session;
mod snapshot;
mod source;
mod tracer;

pub use breakpoints::{BreakpointError, BreakpointRegistry};
pub use link::Channel;
pub use session::Outcome;
pub use tracer::StepMode;

use link::Link;
use session::Session;

/// Serve a single session over this process' stdin and stdout.
///
/// Frames go to a private copy of stdout. File descriptor 1 itself is
/// pointed at stderr, so child processes and C libraries that print
/// cannot corrupt the stream.
pub fn serve() -> eyre::Result<()> {
    let protocol = reserve_stdout().wrap_err("reserving stdout for the protocol")?;
    let stdin = std::io::stdin().lock();
    let channel = StreamDuplex::new(stdin, BufWriter::new(File::from(protocol)));
    run(Box::new(channel)).map(|_| ())
}

fn reserve_stdout() -> nix::Result<OwnedFd> {
    let protocol = nix::unistd::dup(std::io::stdout())?;
    nix::unistd::dup2_stdout(std::io::stderr())?;
    Ok(protocol)
}

/// Serve a single session over `channel`.
#[tracing::instrument(skip(channel))]
pub fn run(channel: Channel) -> eyre::Result<Outcome> {
    let link = Rc::new(Link::new(channel));

    let arguments = match link.recv() {
        Some(HostMessage::Launch(arguments)) => arguments,
        Some(other) => {
            link.send(Event::StdErr {
                text: format!("protocol error: expected launch arguments, got {other:?}\n"),
            });
            link.send(Event::Finished);
            eyre::bail!("protocol error: first message was not a launch");
        }
        None => eyre::bail!("host closed the channel before launching"),
    };

    let outcome = Session::new(Rc::clone(&link), arguments).run();
    link.send(Event::Finished);
    Ok(outcome)
}
