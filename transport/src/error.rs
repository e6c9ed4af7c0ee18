use std::io;

/// Failures while framing or exchanging messages.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid UTF-8 in header")]
    InvalidUtf8,

    /// A header line that is not a `Name: value` pair.
    #[error("unsupported header '{0}'")]
    UnsupportedHeader(String),

    #[error("malformed Content-Length header value")]
    MalformedContentLength,

    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The stream ended part way through a frame.
    #[error("stream closed in the middle of a message")]
    UnexpectedEof,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("could not decode message body: {0}")]
    JsonDeserialize(#[source] serde_json::Error),

    #[error("could not encode message: {0}")]
    JsonSerialize(#[source] serde_json::Error),

    /// The peer of an in-memory channel was dropped.
    #[error("peer disconnected")]
    Disconnected,
}
