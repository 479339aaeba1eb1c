//! Error types for the spindle crate.

use std::io;

use crate::frame::RstStatus;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a SPDY connection or stream.
///
/// Connection-fatal errors (`Transport`, `ConnectionEnd`, `Protocol`,
/// `HeaderCompression`) tear down every live stream; stream-fatal errors
/// (`RstStream`, `DoubleResponse`, `Cancelled`) are reported to the owning
/// request only. `AlreadySent` is returned synchronously from a misused call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying socket or TLS I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionEnd,

    /// Malformed inbound frame or a frame for a stream we do not know.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stateful zlib header codec failed; the connection cannot recover.
    #[error("header compression error: {0}")]
    HeaderCompression(String),

    /// The peer aborted the stream with RST_STREAM.
    #[error("stream reset by peer: {0}")]
    RstStream(RstStatus),

    /// A second SYN_REPLY arrived for a stream that already has a response.
    #[error("double response on stream")]
    DoubleResponse,

    /// The stream was abandoned locally before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// `Connection::send` was called with a request that is already bound
    /// to a connection.
    #[error("request was already sent")]
    AlreadySent,
}

impl Error {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a header compression error.
    pub fn compression(message: impl Into<String>) -> Self {
        Self::HeaderCompression(message.into())
    }

    /// Whether this error terminates the whole connection rather than a
    /// single stream.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectionEnd | Self::Protocol(_) | Self::HeaderCompression(_)
        )
    }
}

// Connection-fatal errors fan out to every live stream, so the error must be
// reproducible per recipient. `io::Error` is not `Clone`; rebuild it from its
// kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Transport(e) => Self::Transport(io::Error::new(e.kind(), e.to_string())),
            Self::ConnectionEnd => Self::ConnectionEnd,
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::HeaderCompression(m) => Self::HeaderCompression(m.clone()),
            Self::RstStream(s) => Self::RstStream(*s),
            Self::DoubleResponse => Self::DoubleResponse,
            Self::Cancelled => Self::Cancelled,
            Self::AlreadySent => Self::AlreadySent,
        }
    }
}
