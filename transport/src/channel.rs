//! Point-to-point duplex channels.
//!
//! The worker is written against [`Duplex`] so that it can run over its
//! stdio pipes in production and over an in-memory pair in tests.
use std::io::{BufRead, Write};

use crossbeam_channel::{Receiver, Sender};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::{FrameReader, FrameWriter},
    error::TransportError,
};

/// Sending half of a channel.
pub trait Outbox<M> {
    fn send(&mut self, message: M) -> Result<(), TransportError>;
}

/// A channel that can both send `Out` and receive `In` messages.
pub trait Duplex<Out, In>: Outbox<Out> {
    /// Block until the next message arrives. `Ok(None)` means the peer
    /// closed the channel.
    fn recv(&mut self) -> Result<Option<In>, TransportError>;
}

impl<M> Outbox<M> for Sender<M> {
    fn send(&mut self, message: M) -> Result<(), TransportError> {
        Sender::send(self, message).map_err(|_| TransportError::Disconnected)
    }
}

impl<W, M> Outbox<M> for FrameWriter<W>
where
    W: Write,
    M: Serialize,
{
    fn send(&mut self, message: M) -> Result<(), TransportError> {
        FrameWriter::send(self, &message)
    }
}

/// Framed duplex over a pair of byte streams, e.g. stdin and stdout.
pub struct StreamDuplex<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> StreamDuplex<R, W>
where
    R: BufRead,
    W: Write,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            reader: FrameReader::new(input),
            writer: FrameWriter::new(output),
        }
    }
}

impl<R, W, Out> Outbox<Out> for StreamDuplex<R, W>
where
    W: Write,
    Out: Serialize,
{
    fn send(&mut self, message: Out) -> Result<(), TransportError> {
        self.writer.send(&message)
    }
}

impl<R, W, Out, In> Duplex<Out, In> for StreamDuplex<R, W>
where
    R: BufRead,
    W: Write,
    Out: Serialize,
    In: DeserializeOwned,
{
    fn recv(&mut self) -> Result<Option<In>, TransportError> {
        self.reader.poll_message()
    }
}

/// In-memory duplex built from two crossbeam channels.
pub struct MemoryDuplex<Out, In> {
    tx: Sender<Out>,
    rx: Receiver<In>,
}

impl<Out, In> MemoryDuplex<Out, In> {
    pub fn into_parts(self) -> (Sender<Out>, Receiver<In>) {
        (self.tx, self.rx)
    }
}

impl<Out, In> Outbox<Out> for MemoryDuplex<Out, In> {
    fn send(&mut self, message: Out) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }
}

impl<Out, In> Duplex<Out, In> for MemoryDuplex<Out, In> {
    fn recv(&mut self) -> Result<Option<In>, TransportError> {
        Ok(self.rx.recv().ok())
    }
}

/// Create two connected in-memory endpoints.
pub fn memory_pair<A, B>() -> (MemoryDuplex<A, B>, MemoryDuplex<B, A>) {
    let (a_tx, a_rx) = crossbeam_channel::unbounded();
    let (b_tx, b_rx) = crossbeam_channel::unbounded();
    (
        MemoryDuplex { tx: a_tx, rx: b_rx },
        MemoryDuplex { tx: b_tx, rx: a_rx },
    )
}
