use std::net::SocketAddr;

/// Negotiated RTP transport for one track of a session (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// UDP player:
///   C→S Transport: RTP/AVP;unicast;client_port=8000-8001
///   S→C Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=8000-8001
///
/// TCP interleaved publisher:
///   C→S Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record
///   S→C Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// RTP over UDP. For players the relay sends to `client_addr`; for
    /// publishers it accepts datagrams whose source is `client_addr`.
    Udp {
        client_addr: SocketAddr,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    /// RTP framed on the RTSP connection (RFC 2326 §10.12).
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl Transport {
    /// Value of the `Transport` header in the SETUP response.
    pub fn response_header(&self, record: bool) -> String {
        let mut value = match self {
            Transport::Udp {
                client_addr,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_addr.port(),
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port
            ),
            Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
        };
        if record {
            value.push_str(";mode=record");
        }
        value
    }
}

/// Parsed client request from the RTSP `Transport` header.
///
/// Only the first transport spec of a comma-separated list is considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeader {
    /// `RTP/AVP/TCP` lower transport requested.
    pub tcp: bool,
    /// `multicast` requested instead of `unicast`.
    pub multicast: bool,
    /// Client's requested RTP/RTCP ports.
    pub client_port: Option<(u16, u16)>,
    /// Requested interleaved channels.
    pub interleaved: Option<(u8, u8)>,
    /// `mode=record` (publisher SETUP).
    pub record: bool,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Returns `None` when the profile is not `RTP/AVP`.
    ///
    /// ## Examples
    ///
    /// ```
    /// use relay::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    /// assert!(!th.tcp);
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3;mode=record").unwrap();
    /// assert_eq!(th.interleaved, Some((2, 3)));
    /// assert!(th.record);
    ///
    /// assert!(TransportHeader::parse("RAW/RAW/UDP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?.trim();
        let mut parts = spec.split(';').map(str::trim);

        let protocol = parts.next()?;
        let tcp = match protocol.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return None,
        };

        let mut th = TransportHeader {
            tcp,
            ..Default::default()
        };

        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (part, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("multicast", None) => th.multicast = true,
                ("unicast", None) => th.multicast = false,
                ("client_port", Some(v)) => th.client_port = parse_ports(v),
                ("interleaved", Some(v)) => th.interleaved = parse_channels(v),
                ("mode", Some(v)) => {
                    th.record = v.trim_matches('"').eq_ignore_ascii_case("record");
                }
                _ => {}
            }
        }

        Some(th)
    }
}

/// `8000-8001` → (8000, 8001); a single value `8000` → (8000, 8001).
fn parse_ports(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}

/// `0-1` → (0, 1); a single value `2` → (2, 3).
fn parse_channels(value: &str) -> Option<(u8, u8)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u8 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}
