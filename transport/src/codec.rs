//! Blocking `Content-Length` framing over any byte stream.
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <JSON body>
//! ```
use std::io::{self, BufRead, Write};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::TransportError;

/// Default maximum message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encode a single message, header included.
pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(message).map_err(TransportError::JsonSerialize)?;
    let mut out = Vec::with_capacity(32 + json.len());
    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(json.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(&json);
    Ok(out)
}

pub struct FrameReader<R> {
    input: R,
    max_message_size: usize,
}

impl<R> FrameReader<R>
where
    R: BufRead,
{
    pub fn new(input: R) -> Self {
        Self::with_max_size(input, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(input: R, max_message_size: usize) -> Self {
        Self {
            input,
            max_message_size,
        }
    }

    /// Block until the next message arrives.
    ///
    /// Returns `Ok(None)` when the stream closes cleanly between messages.
    pub fn poll_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, TransportError> {
        let Some(content_length) = self.read_header()? else {
            return Ok(None);
        };

        if content_length > self.max_message_size {
            tracing::warn!(content_length, "rejecting oversized message");
            return Err(TransportError::MessageTooLarge {
                size: content_length,
                max: self.max_message_size,
            });
        }

        let mut body = vec![0; content_length];
        self.input.read_exact(&mut body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::UnexpectedEof
            } else {
                TransportError::Io(e)
            }
        })?;

        let message = serde_json::from_slice(&body).map_err(TransportError::JsonDeserialize)?;
        Ok(Some(message))
    }

    fn read_header(&mut self) -> Result<Option<usize>, TransportError> {
        let mut content_length = None;
        let mut started = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read_size = match self.input.read_until(b'\n', &mut line) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read_size == 0 {
                return if started {
                    Err(TransportError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            }
            started = true;

            let text = std::str::from_utf8(&line).map_err(|_| TransportError::InvalidUtf8)?;
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                return content_length
                    .map(Some)
                    .ok_or(TransportError::MissingContentLength);
            }

            match text.split_once(':') {
                Some((name, value)) if name.trim().eq_ignore_ascii_case("Content-Length") => {
                    let value = value
                        .trim()
                        .parse()
                        .map_err(|_| TransportError::MalformedContentLength)?;
                    content_length = Some(value);
                }
                // other well formed headers (e.g. Content-Type) are ignored
                Some(_) => {}
                None => return Err(TransportError::UnsupportedHeader(text.to_string())),
            }
        }
    }
}

pub struct FrameWriter<W> {
    output: W,
}

impl<W> FrameWriter<W>
where
    W: Write,
{
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<(), TransportError> {
        let frame = encode(message)?;
        tracing::trace!(size = frame.len(), "writing frame");
        self.output.write_all(&frame)?;
        self.output.flush()?;
        Ok(())
    }
}
