use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use transport::{Command, Duplex, Event, HostMessage};

pub type Channel = Box<dyn Duplex<Event, HostMessage>>;

/// Why the debuggee must stop running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Quit,
    Exit(i32),
}

impl Interrupt {
    pub fn to_error(self) -> mlua::Error {
        match self {
            Interrupt::Quit => mlua::Error::RuntimeError("debugger session quit".to_string()),
            Interrupt::Exit(code) => {
                mlua::Error::RuntimeError(format!("script exited with code {code}"))
            }
        }
    }
}

/// The worker's end of the channel, shared by the tracer and the relay.
pub struct Link {
    channel: RefCell<Channel>,
    interrupt: Cell<Option<Interrupt>>,
    /// Commands received while the debuggee could not act on them.
    deferred: RefCell<VecDeque<Command>>,
}

impl Link {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: RefCell::new(channel),
            interrupt: Cell::new(None),
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    /// A host that can no longer be reached ends the session.
    pub fn send(&self, event: Event) {
        tracing::trace!(?event, "sending event");
        if let Err(e) = self.channel.borrow_mut().send(event) {
            tracing::warn!(error = %e, "host unreachable, stopping debuggee");
            self.interrupt(Interrupt::Quit);
        }
    }

    /// `None` once the channel is closed or broken.
    pub fn recv(&self) -> Option<HostMessage> {
        match self.channel.borrow_mut().recv() {
            Ok(message) => {
                tracing::debug!(?message, "received message");
                message
            }
            Err(e) => {
                tracing::warn!(error = %e, "reading from host");
                None
            }
        }
    }

    /// Hold `command` until the tracer next gets control.
    pub fn defer(&self, command: Command) {
        tracing::debug!(?command, "deferring command");
        self.deferred.borrow_mut().push_back(command);
    }

    /// Oldest deferred command, in arrival order.
    pub fn take_deferred(&self) -> Option<Command> {
        self.deferred.borrow_mut().pop_front()
    }

    /// The first interrupt wins.
    pub fn interrupt(&self, interrupt: Interrupt) {
        if self.interrupt.get().is_none() {
            self.interrupt.set(Some(interrupt));
        }
    }

    pub fn interrupted(&self) -> Option<Interrupt> {
        self.interrupt.get()
    }
}
