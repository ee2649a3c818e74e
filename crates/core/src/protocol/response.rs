/// Value of the `Server` header on every response (RFC 2326 §12.36).
pub const SERVER_AGENT: &str = "rtsp-relay/0.1";

/// Reason phrase for the status codes the relay answers with
/// (RFC 2326 §7.1.1).
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// A response on its way back to the client. `Server` is always the first
/// header; `Content-Length` is appended when there is a body.
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16) -> Self {
        RtspResponse {
            status_code,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn bad_request() -> Self {
        Self::new(400)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn session_not_found() -> Self {
        Self::new(454)
    }

    pub fn method_not_valid() -> Self {
        Self::new(455)
    }

    pub fn unsupported_transport() -> Self {
        Self::new(461)
    }

    pub fn internal_error() -> Self {
        Self::new(500)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = format!(
            "RTSP/1.0 {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        match &self.body {
            Some(body) => {
                out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                out.push_str(body);
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}
