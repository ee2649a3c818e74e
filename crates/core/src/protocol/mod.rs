//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! requests, building responses, routing methods to the stream registry,
//! and reading/writing SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! ANNOUNCE rtsp://relay/cam1 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 412\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Relay action |
//! |--------|-------------|--------------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | SDP of the stream published on the path |
//! | ANNOUNCE | §10.3 | Publish (or take over) a path |
//! | SETUP | §10.4 | Negotiate UDP or interleaved transport per track |
//! | PLAY | §10.5 | Attach the player to the stream |
//! | PAUSE | §10.6 | Detach the player |
//! | RECORD | §10.11 | Start forwarding the publisher's packets |
//! | TEARDOWN | §10.7 | Finish the session |
//! | GET_PARAMETER | §10.8 | Keepalive |

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use sdp::{generate_sdp, parse_sdp};
