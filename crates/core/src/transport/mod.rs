//! Network transport layer for RTSP signaling and RTP media.
//!
//! - **TCP** ([`tcp`]): one connection per client, with a thread per
//!   connection. Carries RTSP requests/responses and, for clients that ask
//!   for it, RTP interleaved on the same socket (RFC 2326 §10.12).
//!
//! - **UDP** ([`udp`]): one shared RTP socket receives publisher datagrams
//!   (demultiplexed by source address) and sends player packets.
//!
//! The stream fan-out only sees the [`MediaSink`] trait, so it never knows
//! which of the two a reader negotiated.

pub mod tcp;
pub mod udp;

use std::io;

pub use tcp::{ConnectionWriter, InterleavedSink};
pub use udp::{UdpSink, UdpTransport};

/// Send side of one player track.
///
/// Implementations write the packet synchronously; the caller (the
/// publisher's delivery thread) relies on that for per-track ordering.
pub trait MediaSink: Send + Sync {
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()>;

    /// Whether the sink can never deliver again. A stream detaches readers
    /// whose failed sink reports `true`.
    fn is_closed(&self) -> bool {
        false
    }
}
