//! Wire protocol spoken between the debugger host and its worker process.
//!
//! Messages are JSON bodies framed with a `Content-Length` header, the same
//! framing used by the Debug Adapter Protocol. The host writes
//! [`HostMessage`]s to the worker's stdin and reads [`Event`]s from its
//! stdout.
mod channel;
mod codec;
mod error;
pub mod message;

pub use channel::{memory_pair, Duplex, MemoryDuplex, Outbox, StreamDuplex};
pub use codec::{encode, FrameReader, FrameWriter, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::TransportError;
pub use message::{
    BreakpointAction, Command, Event, Frame, HostMessage, LaunchArguments, SerializedValue,
    SourceBreakpoint, WorkerOptions,
};
