//! Error types for the relay.

use std::fmt;

/// Errors that can occur in the relay.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP messages,
///   [`InvalidDescription`](Self::InvalidDescription) for unusable SDP,
///   [`InvalidRtp`](Self::InvalidRtp) for short or non-v2 RTP packets.
/// - **Transport**: [`Io`](Self::Io) for socket/network failures.
/// - **Stream**: [`StreamClosed`](Self::StreamClosed),
///   [`UnknownTrack`](Self::UnknownTrack),
///   [`ForwardFailed`](Self::ForwardFailed).
/// - **Session**: [`InvalidState`](Self::InvalidState).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed (publisher left or was evicted).
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// Packet addressed to a track index the stream does not have.
    #[error("unknown track {track} on stream {path}")]
    UnknownTrack { path: String, track: usize },

    /// One or more readers rejected a forwarded packet.
    #[error("failed to forward packet to {failed} reader(s) on {path}")]
    ForwardFailed { path: String, failed: usize },

    /// The session state machine does not allow the requested transition.
    #[error("invalid session transition from {from} to {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// SDP body could not be turned into a media description.
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    /// Packet is not a valid RTP packet (RFC 3550 §5.1).
    #[error("invalid RTP packet: {0}")]
    InvalidRtp(&'static str),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
