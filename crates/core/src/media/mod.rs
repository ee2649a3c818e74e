//! Media descriptions and RTP packets.
//!
//! A publisher describes its media with an SDP body in ANNOUNCE. The relay
//! keeps that description as a [`MediaDescription`]: an ordered list of
//! [`Track`]s, each one `m=` section of the SDP. The track index (position in
//! the list) is how packets, SETUP requests and readers refer to a track.
//!
//! The relay never transcodes or repacketizes. Inbound RTP packets
//! ([`rtp::RtpPacket`]) are validated and forwarded byte-for-byte.
//!
//! | Direction | Carried as |
//! |-----------|------------|
//! | publisher → relay | TCP interleaved frame or UDP datagram |
//! | relay → player | same packet bytes, per the player's transport |

pub mod rtp;

use std::fmt;

pub use rtp::RtpPacket;

/// Media type of a track, from the first token of an SDP `m=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
    Other(String),
}

impl MediaKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "application" => Self::Application,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
            Self::Application => f.write_str("application"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One media section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub kind: MediaKind,
    /// Transport protocol from the `m=` line, normally `RTP/AVP`.
    pub protocol: String,
    /// RTP payload types listed on the `m=` line.
    pub formats: Vec<u8>,
    /// Media-level attribute lines (with the `a=` prefix), minus `a=control`.
    pub attributes: Vec<String>,
    /// Control URL as announced by the publisher, if any.
    pub control: Option<String>,
}

impl Track {
    /// Build a single-format RTP/AVP track with an `a=rtpmap` attribute.
    pub fn new(kind: MediaKind, payload_type: u8, codec: &str, clock_rate: u32) -> Self {
        Self {
            kind,
            protocol: "RTP/AVP".to_string(),
            formats: vec![payload_type],
            attributes: vec![format!("a=rtpmap:{payload_type} {codec}/{clock_rate}")],
            control: None,
        }
    }

    pub fn with_attribute(mut self, attribute: &str) -> Self {
        self.attributes.push(attribute.to_string());
        self
    }

    pub fn with_control(mut self, control: &str) -> Self {
        self.control = Some(control.to_string());
        self
    }

    /// First payload type of the `m=` line.
    pub fn payload_type(&self) -> Option<u8> {
        self.formats.first().copied()
    }

    fn rtpmap(&self) -> Option<&str> {
        let pt = self.payload_type()?;
        let prefix = format!("a=rtpmap:{pt} ");
        self.attributes
            .iter()
            .find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    /// Encoding name from `a=rtpmap` (e.g. `H264`).
    pub fn codec(&self) -> Option<&str> {
        self.rtpmap()
            .and_then(|m| m.split('/').next())
            .map(str::trim)
    }

    /// Clock rate from `a=rtpmap` (e.g. 90000).
    pub fn clock_rate(&self) -> Option<u32> {
        self.rtpmap()
            .and_then(|m| m.split('/').nth(1))
            .and_then(|r| r.trim().parse().ok())
    }

    /// Control value the relay advertises for this track in DESCRIBE.
    pub fn control_for(index: usize) -> String {
        format!("trackID={index}")
    }

    /// Whether a SETUP URI suffix addresses this track.
    ///
    /// Accepts the relay's own `trackID=N` form as well as whatever control
    /// the publisher announced (absolute or relative).
    pub fn matches_control(&self, index: usize, suffix: &str) -> bool {
        if suffix == Self::control_for(index) {
            return true;
        }
        match &self.control {
            Some(control) => {
                control == suffix || control.trim_end_matches('/').ends_with(&format!("/{suffix}"))
            }
            None => false,
        }
    }
}

/// Immutable description of everything a publisher sends on a path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescription {
    /// Session name (`s=`) announced by the publisher.
    pub session_name: Option<String>,
    pub tracks: Vec<Track>,
}

impl MediaDescription {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            session_name: None,
            tracks,
        }
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Resolve the track addressed by a SETUP URI suffix.
    ///
    /// With no suffix, a single-track description resolves to track 0.
    pub fn resolve_track(&self, suffix: Option<&str>) -> Option<usize> {
        match suffix {
            Some(suffix) => self
                .tracks
                .iter()
                .enumerate()
                .find(|(i, t)| t.matches_control(*i, suffix))
                .map(|(i, _)| i),
            None if self.tracks.len() == 1 => Some(0),
            None => None,
        }
    }

    /// Short `kind:codec` summary for logs, e.g. `video:H264,audio:MPEG4-GENERIC`.
    pub fn summary(&self) -> String {
        self.tracks
            .iter()
            .map(|t| format!("{}:{}", t.kind, t.codec().unwrap_or("?")))
            .collect::<Vec<_>>()
            .join(",")
    }
}
