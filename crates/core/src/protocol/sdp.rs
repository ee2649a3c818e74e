//! SDP (Session Description Protocol, RFC 8866) in both directions.
//!
//! - [`parse_sdp`] turns the body of a publisher's ANNOUNCE into a
//!   [`MediaDescription`].
//! - [`generate_sdp`] renders that description for DESCRIBE responses:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtsp-relay                            ← server software
//! a=sendonly                                   ← direction
//! m=video 0 RTP/AVP 96                         ← one section per track
//! a=rtpmap:96 H264/90000                       ← publisher's attributes
//! a=fmtp:96 packetization-mode=1;...
//! a=control:trackID=0                          ← relay's control URL
//! ```
//!
//! Session-level fields are the relay's own (from
//! [`ServerConfig`](crate::ServerConfig)); media sections are the
//! publisher's, with control URLs rewritten to `trackID=N`.

use crate::error::{RelayError, Result};
use crate::media::{MediaDescription, MediaKind, Track};

/// Session-level fields of a generated SDP.
#[derive(Debug, Clone, Copy)]
pub struct SdpOrigin<'a> {
    pub ip: &'a str,
    pub session_id: &'a str,
    pub session_version: &'a str,
    pub username: &'a str,
    pub session_name: &'a str,
}

/// Generate an SDP session description for a stream.
pub fn generate_sdp(description: &MediaDescription, origin: &SdpOrigin<'_>) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        origin.username, origin.session_id, origin.session_version, origin.ip
    ));
    sdp.push(format!("s={}", origin.session_name));
    sdp.push(format!("c=IN IP4 {}", origin.ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-relay".to_string());
    sdp.push("a=sendonly".to_string());

    for (index, track) in description.tracks.iter().enumerate() {
        let formats: Vec<String> = track.formats.iter().map(u8::to_string).collect();
        sdp.push(format!("m={} 0 {} {}", track.kind, track.protocol, formats.join(" ")));
        sdp.extend(track.attributes.iter().cloned());
        sdp.push(format!("a=control:{}", Track::control_for(index)));
    }

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Parse an announced SDP body.
///
/// Keeps each media section's formats and attributes. Direction attributes
/// are dropped (the relay is always `sendonly` towards players) and
/// `a=control` is kept separately for SETUP matching. Session-level lines
/// other than `s=` are ignored.
pub fn parse_sdp(body: &str) -> Result<MediaDescription> {
    let mut description = MediaDescription::default();
    let mut current: Option<Track> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (kind, value) = line
            .split_once('=')
            .filter(|(k, _)| k.len() == 1)
            .ok_or_else(|| RelayError::InvalidDescription(format!("malformed line: {line}")))?;

        match kind {
            "s" if current.is_none() => description.session_name = Some(value.to_string()),
            "m" => {
                if let Some(track) = current.take() {
                    description.tracks.push(track);
                }
                current = Some(parse_media_line(value)?);
            }
            "a" => {
                let Some(track) = current.as_mut() else {
                    continue;
                };
                if let Some(control) = value.strip_prefix("control:") {
                    track.control = Some(control.trim().to_string());
                } else if !matches!(value, "sendonly" | "recvonly" | "sendrecv" | "inactive") {
                    track.attributes.push(line.to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(track) = current {
        description.tracks.push(track);
    }

    if description.tracks.is_empty() {
        return Err(RelayError::InvalidDescription("no media sections".to_string()));
    }
    Ok(description)
}

/// `video 0 RTP/AVP 96 97` → Track
fn parse_media_line(value: &str) -> Result<Track> {
    let mut fields = value.split_whitespace();
    let (Some(kind), Some(_port), Some(protocol)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(RelayError::InvalidDescription(format!("malformed m= line: {value}")));
    };

    Ok(Track {
        kind: MediaKind::parse(kind),
        protocol: protocol.to_string(),
        formats: fields.filter_map(|f| f.parse().ok()).collect(),
        attributes: Vec::new(),
        control: None,
    })
}
