use crate::error::{ParseErrorKind, RelayError};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. ANNOUNCE carries
/// its SDP in the body; the connection reads `Content-Length` bytes after
/// the blank line and attaches them with [`with_body`](Self::with_body).
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, ...).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/cam1/trackID=0`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspRequest {
    /// Parse an RTSP request from its text representation.
    ///
    /// Anything after the blank line that ends the headers is taken as the
    /// body. Returns [`RelayError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(RelayError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RelayError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: body.filter(|b| !b.is_empty()).map(str::to_string),
        })
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Body length announced by `Content-Length` (0 when absent).
    pub fn content_length(&self) -> crate::error::Result<usize> {
        match self.get_header("Content-Length") {
            Some(v) => v.trim().parse().map_err(|_| RelayError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
            None => Ok(0),
        }
    }
}

fn split_head(raw: &str) -> (&str, Option<&str>) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], Some(&raw[pos + 4..]))
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], Some(&raw[pos + 2..]))
    } else {
        (raw, None)
    }
}
