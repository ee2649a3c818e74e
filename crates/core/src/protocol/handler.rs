use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::RelayError;
use crate::media::{RtpPacket, Track};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::registry::{PublisherHandle, extract_path};
use crate::server::RelayContext;
use crate::session::transport::TransportHeader;
use crate::session::{Session, SessionId, SessionState, TrackBinding, Transport};
use crate::stream::Stream;
use crate::transport::{ConnectionWriter, InterleavedSink, MediaSink, UdpSink};

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, TEARDOWN, GET_PARAMETER";

/// Routes RTSP requests and interleaved frames of one TCP connection.
///
/// Owns the sessions opened on this connection so they can be finished when
/// the connection drops. Publisher sessions get a clone of the control
/// socket, which the registry uses to force them off on eviction.
pub struct MethodHandler {
    context: RelayContext,
    client_addr: SocketAddr,
    writer: ConnectionWriter,
    control: Option<TcpStream>,
    sessions: Vec<Arc<Session>>,
    /// Interleaved RTP channel → (publisher session, track).
    interleaved: HashMap<u8, (Arc<Session>, usize)>,
}

impl MethodHandler {
    pub(crate) fn new(
        context: RelayContext,
        client_addr: SocketAddr,
        writer: ConnectionWriter,
        control: Option<TcpStream>,
    ) -> Self {
        MethodHandler {
            context,
            client_addr,
            writer,
            control,
            sessions: Vec::new(),
            interleaved: HashMap::new(),
        }
    }

    /// Sessions opened on this connection and not yet finished.
    #[cfg(test)]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let response = match request.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(&request.uri),
            "ANNOUNCE" => self.handle_announce(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "RECORD" => self.handle_record(request),
            "PAUSE" => self.handle_pause(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501)
            }
        };

        response.add_header("CSeq", cseq)
    }

    /// Deliver an interleaved frame received on this connection.
    pub fn handle_interleaved(&self, channel: u8, payload: Bytes) {
        let Some((session, track)) = self.interleaved.get(&channel) else {
            tracing::trace!(channel, len = payload.len(), "interleaved frame on unbound channel");
            return;
        };
        match RtpPacket::parse(payload) {
            Ok(packet) => {
                if !session.deliver(*track, packet) {
                    tracing::trace!(session_id = %session.id, channel, "packet before RECORD dropped");
                }
            }
            Err(e) => tracing::debug!(channel, error = %e, "invalid interleaved RTP"),
        }
    }

    /// Finish every session of this connection (disconnect).
    pub fn close_all_sessions(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        if sessions.is_empty() {
            return;
        }
        for session in &sessions {
            self.finish_session(session);
        }
        tracing::info!(peer = %self.client_addr, closed = sessions.len(), "cleaned up sessions on disconnect");
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.context.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, uri: &str) -> RtspResponse {
        let path = extract_path(uri);
        let Some(stream) = self.context.registry.lookup(path) else {
            tracing::debug!(path, "DESCRIBE for unknown path");
            return RtspResponse::not_found();
        };

        let host = self.host_from_uri_or_client(uri);
        let config = &self.context.config;
        let description = stream.description();
        let origin = SdpOrigin {
            ip: &host,
            session_id: &config.sdp_session_id,
            session_version: &config.sdp_session_version,
            username: &config.sdp_username,
            session_name: description
                .session_name
                .as_deref()
                .unwrap_or(&config.sdp_session_name),
        };
        let body = sdp::generate_sdp(description, &origin);

        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base(uri))
            .with_body(body)
    }

    fn handle_announce(&mut self, request: &RtspRequest) -> RtspResponse {
        let path = extract_path(&request.uri);
        let description = match request.body.as_deref().map(sdp::parse_sdp) {
            Some(Ok(d)) => d,
            Some(Err(e)) => {
                tracing::warn!(path, error = %e, "ANNOUNCE with unusable SDP");
                return RtspResponse::bad_request();
            }
            None => {
                tracing::warn!(path, "ANNOUNCE without body");
                return RtspResponse::bad_request();
            }
        };

        // Re-announce on an existing publisher session keeps its identity.
        let session = match self.own_session(request) {
            Some(s)
                if s.state() == SessionState::Announced
                    && s.stream().is_none_or(|own| own.path() == path) =>
            {
                s
            }
            Some(s) => {
                tracing::debug!(session_id = %s.id, state = s.state().as_str(), "ANNOUNCE in wrong state");
                return RtspResponse::method_not_valid();
            }
            None => self.open_session(),
        };
        if let Err(e) = session.transition(SessionState::Announced) {
            tracing::debug!(session_id = %session.id, error = %e, "ANNOUNCE rejected");
            return RtspResponse::method_not_valid();
        }

        // Evicting a publisher on this same connection would shut down the
        // socket this response goes out on; finish it here instead.
        if let Some(previous) = self.context.registry.publisher_of(path)
            && previous != session.id
            && let Some(local) = self.sessions.iter().find(|s| s.id == previous).cloned()
        {
            self.finish_session(&local);
            self.sessions.retain(|s| s.id != previous);
            tracing::info!(path, evicted = %previous, publisher = %session.id, "publisher replaced on same connection");
        }

        let publisher: Arc<dyn PublisherHandle> = session.clone();
        let stream = self.context.registry.publish(path, description, publisher);
        session.set_stream(stream);

        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some((stream, suffix)) = self.context.registry.resolve(&request.uri) else {
            tracing::debug!(uri = %request.uri, "SETUP for unknown path");
            return RtspResponse::not_found();
        };
        let Some(track) = stream.description().resolve_track(suffix) else {
            tracing::debug!(uri = %request.uri, "SETUP for unknown track");
            return RtspResponse::not_found();
        };

        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(uri = %request.uri, "SETUP missing Transport header");
            return RtspResponse::bad_request();
        };
        let requested = match TransportHeader::parse(header) {
            Some(t) if !t.multicast => t,
            _ => {
                tracing::debug!(transport = header, "unsupported transport");
                return RtspResponse::unsupported_transport();
            }
        };

        let existing = match request.get_header("Session") {
            Some(_) => match self.own_session(request) {
                Some(s) => Some(s),
                None => return RtspResponse::session_not_found(),
            },
            None => None,
        };

        match existing {
            Some(session) if session.state().is_publisher() => {
                self.setup_publisher(session, &stream, track, &requested)
            }
            _ if requested.record => {
                tracing::debug!(uri = %request.uri, "mode=record SETUP without ANNOUNCE");
                RtspResponse::method_not_valid()
            }
            existing => self.setup_player(existing, &stream, track, &requested),
        }
    }

    fn setup_publisher(
        &mut self,
        session: Arc<Session>,
        stream: &Arc<Stream>,
        track: usize,
        requested: &TransportHeader,
    ) -> RtspResponse {
        let announced = session.stream();
        if !announced.is_some_and(|own| Arc::ptr_eq(&own, stream)) {
            tracing::debug!(session_id = %session.id, path = stream.path(), "SETUP on a stream this session does not publish");
            return RtspResponse::not_found();
        }
        if let Err(e) = session.transition(SessionState::Announced) {
            tracing::debug!(session_id = %session.id, error = %e, "publisher SETUP rejected");
            return RtspResponse::method_not_valid();
        }

        let transport = match self.negotiate(requested, track) {
            Ok(t) => t,
            Err(response) => return response,
        };
        match &transport {
            Transport::Interleaved { rtp_channel, .. } => {
                self.interleaved.insert(*rtp_channel, (session.clone(), track));
            }
            Transport::Udp { client_addr, .. } => {
                if let Some(udp) = &self.context.udp {
                    udp.register_source(*client_addr, session.clone(), track);
                }
            }
        }

        tracing::info!(session_id = %session.id, path = stream.path(), track, transport = ?transport, "publisher track set up");
        let header = transport.response_header(true);
        session.bind_track(TrackBinding {
            track,
            transport,
            sink: None,
        });

        RtspResponse::ok()
            .add_header("Transport", &header)
            .add_header("Session", &session.session_header_value())
    }

    fn setup_player(
        &mut self,
        existing: Option<Arc<Session>>,
        stream: &Arc<Stream>,
        track: usize,
        requested: &TransportHeader,
    ) -> RtspResponse {
        if let Some(session) = &existing
            && let Some(current) = session.stream()
            && !Arc::ptr_eq(&current, stream)
        {
            tracing::debug!(session_id = %session.id, "SETUP of a second stream in one session");
            return RtspResponse::method_not_valid();
        }

        let transport = match self.negotiate(requested, track) {
            Ok(t) => t,
            Err(response) => return response,
        };
        let sink: Arc<dyn MediaSink> = match &transport {
            Transport::Interleaved { rtp_channel, .. } => {
                Arc::new(InterleavedSink::new(self.writer.clone(), *rtp_channel))
            }
            Transport::Udp { client_addr, .. } => match &self.context.udp {
                Some(udp) => Arc::new(UdpSink::new(udp.clone(), *client_addr)),
                None => return RtspResponse::unsupported_transport(),
            },
        };

        let session = existing.unwrap_or_else(|| self.open_session());
        if let Err(e) = session.transition(SessionState::Setup) {
            tracing::debug!(session_id = %session.id, error = %e, "player SETUP rejected");
            return RtspResponse::method_not_valid();
        }
        session.set_stream(stream.clone());

        tracing::info!(session_id = %session.id, path = stream.path(), track, transport = ?transport, "player track set up");
        let header = transport.response_header(false);
        session.bind_track(TrackBinding {
            track,
            transport,
            sink: Some(sink),
        });

        RtspResponse::ok()
            .add_header("Transport", &header)
            .add_header("Session", &session.session_header_value())
    }

    /// Pick the concrete transport for a SETUP, or the error response.
    fn negotiate(&self, requested: &TransportHeader, track: usize) -> Result<Transport, RtspResponse> {
        if requested.tcp {
            let (rtp_channel, rtcp_channel) = match requested.interleaved {
                Some(channels) => channels,
                None => default_channels(track).ok_or_else(RtspResponse::unsupported_transport)?,
            };
            return Ok(Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
            });
        }

        let Some(udp) = &self.context.udp else {
            tracing::debug!("UDP transport requested but disabled");
            return Err(RtspResponse::unsupported_transport());
        };
        let Some((rtp_port, rtcp_port)) = requested.client_port else {
            tracing::debug!("UDP SETUP without client_port");
            return Err(RtspResponse::bad_request());
        };
        Ok(Transport::Udp {
            client_addr: SocketAddr::new(self.client_addr.ip(), rtp_port),
            client_rtcp_port: rtcp_port,
            server_rtp_port: udp.rtp_port(),
            server_rtcp_port: udp.rtcp_port(),
        })
    }

    fn handle_play(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.required_session(request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        let Some(stream) = session.stream().filter(|s| !s.is_closed()) else {
            tracing::debug!(session_id = %session.id, "PLAY on a stream that is gone");
            return RtspResponse::not_found();
        };
        if let Err(e) = session.transition(SessionState::Playing) {
            tracing::debug!(session_id = %session.id, error = %e, "PLAY rejected");
            return RtspResponse::method_not_valid();
        }

        match stream.attach(session.id, session.sinks()) {
            Ok(()) => {}
            Err(RelayError::StreamClosed(_)) => {
                tracing::debug!(session_id = %session.id, path = stream.path(), "PLAY raced stream close");
                return RtspResponse::not_found();
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "attach failed");
                return RtspResponse::internal_error();
            }
        }

        tracing::info!(session_id = %session.id, path = stream.path(), readers = stream.reader_count(), "session started playing");

        let base = request.uri.trim_end_matches('/');
        let base = base
            .rsplit_once('/')
            .filter(|(_, last)| stream.description().resolve_track(Some(*last)).is_some())
            .map_or(base, |(parent, _)| parent);
        let rtp_info: Vec<String> = session
            .tracks()
            .iter()
            .map(|b| format!("url={}/{}", base, Track::control_for(b.track)))
            .collect();

        RtspResponse::ok()
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info.join(","))
    }

    fn handle_record(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.required_session(request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        let Some(stream) = session.stream() else {
            return RtspResponse::method_not_valid();
        };

        // The path may have been taken over since ANNOUNCE.
        let current = self.context.registry.lookup(stream.path());
        if !current.is_some_and(|c| Arc::ptr_eq(&c, &stream)) {
            tracing::debug!(session_id = %session.id, path = stream.path(), "RECORD on a superseded stream");
            return RtspResponse::not_found();
        }
        if session.state() != SessionState::Announced {
            tracing::debug!(session_id = %session.id, state = session.state().as_str(), "RECORD in wrong state");
            return RtspResponse::method_not_valid();
        }

        if let Err(e) = session.transition(SessionState::Recording) {
            tracing::debug!(session_id = %session.id, error = %e, "RECORD rejected");
            return RtspResponse::method_not_valid();
        }

        let registry = self.context.registry.clone();
        let target = stream.clone();
        session.set_packet_handler(Arc::new(move |track, packet| {
            match registry.forward(&target, track, &packet) {
                Ok(()) => {}
                Err(RelayError::StreamClosed(path)) => {
                    tracing::debug!(path, "packet for closed stream dropped");
                }
                Err(e) => tracing::warn!(error = %e, "packet forward failed"),
            }
        }));

        tracing::info!(session_id = %session.id, path = stream.path(), "session started recording");
        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.required_session(request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        if session.state() != SessionState::Playing {
            return RtspResponse::method_not_valid();
        }
        if let Err(e) = session.transition(SessionState::Setup) {
            tracing::debug!(session_id = %session.id, error = %e, "PAUSE rejected");
            return RtspResponse::method_not_valid();
        }
        if let Some(stream) = session.stream() {
            stream.detach(session.id);
        }
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.required_session(request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        self.finish_session(&session);
        self.sessions.retain(|s| s.id != session.id);
        tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let response = RtspResponse::ok();
        match self.own_session(request) {
            Some(session) => response.add_header("Session", &session.session_header_value()),
            None => response,
        }
    }

    fn open_session(&mut self) -> Arc<Session> {
        let control = self.control.as_ref().and_then(|c| c.try_clone().ok());
        let session = self.context.sessions.create_session(control);
        self.sessions.push(session.clone());
        session
    }

    /// Session named by the request's `Session` header.
    fn own_session(&self, request: &RtspRequest) -> Option<Arc<Session>> {
        let id: SessionId = request.get_header("Session")?.parse().ok()?;
        self.context
            .sessions
            .get_session(id)
            .filter(|s| !s.is_finished())
    }

    fn required_session(&self, request: &RtspRequest) -> Result<Arc<Session>, RtspResponse> {
        self.own_session(request).ok_or_else(|| {
            tracing::debug!(method = %request.method, session = ?request.get_header("Session"), "unknown session");
            RtspResponse::session_not_found()
        })
    }

    /// Release everything a session holds. Runs once per session no matter
    /// how many of TEARDOWN, disconnect and eviction get here.
    fn finish_session(&mut self, session: &Arc<Session>) {
        if !session.finish() {
            return;
        }
        let freed = self.context.registry.unpublish(session.id);
        if let Some(stream) = session.stream() {
            stream.detach(session.id);
        }
        if let Some(udp) = &self.context.udp {
            udp.unregister_session(session.id);
        }
        self.interleaved.retain(|_, (s, _)| s.id != session.id);
        self.context.sessions.remove_session(session.id);
        tracing::info!(session_id = %session.id, freed_path = ?freed, "session closed");
    }
}

/// `Content-Base` for a DESCRIBE: the request URI with a trailing slash.
fn content_base(uri: &str) -> String {
    if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    }
}

/// Interleaved channels when the client did not ask for any: 0-1 for
/// track 0, 2-3 for track 1, ...
fn default_channels(track: usize) -> Option<(u8, u8)> {
    let rtp = u8::try_from(track.checked_mul(2)?).ok()?;
    Some((rtp, rtp.checked_add(1)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::test_packet;
    use crate::registry::StreamRegistry;
    use crate::server::ServerConfig;
    use crate::session::SessionManager;
    use parking_lot::Mutex;
    use std::io::{self, Write};

    const H264_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:streamid=0\r\n";

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn context() -> RelayContext {
        RelayContext {
            registry: StreamRegistry::new(),
            sessions: SessionManager::new(),
            udp: None,
            config: Arc::new(ServerConfig::default().without_udp()),
        }
    }

    fn handler(ctx: &RelayContext) -> (MethodHandler, SharedBuf) {
        let buf = SharedBuf::default();
        let h = MethodHandler::new(
            ctx.clone(),
            "127.0.0.1:50000".parse().unwrap(),
            ConnectionWriter::new(buf.clone()),
            None,
        );
        (h, buf)
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> RtspRequest {
        let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: 7\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    fn header<'a>(response: &'a RtspResponse, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// ANNOUNCE + SETUP + RECORD; returns the publisher's Session header.
    fn publish(h: &mut MethodHandler, path: &str) -> String {
        let uri = format!("rtsp://127.0.0.1{path}");
        let announce = request("ANNOUNCE", &uri, &[]).with_body(H264_SDP.to_string());
        let resp = h.handle(&announce);
        assert_eq!(resp.status_code, 200);
        let session = header(&resp, "Session").unwrap().to_string();

        let setup = request(
            "SETUP",
            &format!("{uri}/streamid=0"),
            &[
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"),
                ("Session", &session),
            ],
        );
        let resp = h.handle(&setup);
        assert_eq!(resp.status_code, 200);
        assert_eq!(
            header(&resp, "Transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")
        );

        let resp = h.handle(&request("RECORD", &uri, &[("Session", &session)]));
        assert_eq!(resp.status_code, 200);
        session
    }

    /// SETUP + PLAY over interleaved channel 0.
    fn play(h: &mut MethodHandler, path: &str) -> String {
        let uri = format!("rtsp://127.0.0.1{path}");
        let resp = h.handle(&request(
            "SETUP",
            &format!("{uri}/trackID=0"),
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        ));
        assert_eq!(resp.status_code, 200);
        let session = header(&resp, "Session").unwrap().to_string();

        let resp = h.handle(&request("PLAY", &uri, &[("Session", &session)]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(
            header(&resp, "RTP-Info"),
            Some(format!("url={uri}/trackID=0").as_str())
        );
        session
    }

    #[test]
    fn options_lists_methods_and_echoes_cseq() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let resp = h.handle(&request("OPTIONS", "rtsp://127.0.0.1/", &[]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(header(&resp, "CSeq"), Some("7"));
        assert!(header(&resp, "Public").unwrap().contains("ANNOUNCE"));
        assert!(header(&resp, "Public").unwrap().contains("RECORD"));
    }

    #[test]
    fn describe_unknown_path_is_404() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let resp = h.handle(&request("DESCRIBE", "rtsp://127.0.0.1/cam2", &[]));
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn announce_then_describe() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let announce = request("ANNOUNCE", "rtsp://127.0.0.1/cam1", &[]).with_body(H264_SDP.to_string());
        let resp = h.handle(&announce);
        assert_eq!(resp.status_code, 200);
        assert!(header(&resp, "Session").is_some());
        assert_eq!(ctx.registry.paths(), vec!["/cam1".to_string()]);

        let resp = h.handle(&request("DESCRIBE", "rtsp://127.0.0.1/cam1", &[]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(header(&resp, "Content-Base"), Some("rtsp://127.0.0.1/cam1/"));
        let body = resp.body.unwrap();
        assert!(body.contains("a=rtpmap:96 H264/90000"));
        assert!(body.contains("a=control:trackID=0"));
        assert!(body.contains("s=cam"));
    }

    #[test]
    fn announce_with_bad_sdp_is_400() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let announce = request("ANNOUNCE", "rtsp://127.0.0.1/cam1", &[]).with_body("v=0\r\n".to_string());
        assert_eq!(h.handle(&announce).status_code, 400);
        let announce = request("ANNOUNCE", "rtsp://127.0.0.1/cam1", &[]);
        assert_eq!(h.handle(&announce).status_code, 400);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn setup_unknown_path_or_track_is_404() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let tcp = [("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")];
        assert_eq!(h.handle(&request("SETUP", "rtsp://127.0.0.1/nope/trackID=0", &tcp)).status_code, 404);

        publish(&mut h, "/cam1");
        let (mut player, _) = handler(&ctx);
        assert_eq!(player.handle(&request("SETUP", "rtsp://127.0.0.1/cam1/trackID=5", &tcp)).status_code, 404);
    }

    #[test]
    fn setup_unsupported_transports_are_461() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        publish(&mut publisher, "/cam1");

        let (mut h, _) = handler(&ctx);
        let uri = "rtsp://127.0.0.1/cam1/trackID=0";
        let multicast = [("Transport", "RTP/AVP;multicast;port=5000-5001")];
        assert_eq!(h.handle(&request("SETUP", uri, &multicast)).status_code, 461);
        let savp = [("Transport", "RTP/SAVP;unicast;client_port=5000-5001")];
        assert_eq!(h.handle(&request("SETUP", uri, &savp)).status_code, 461);
        // UDP is disabled in this context.
        let udp = [("Transport", "RTP/AVP;unicast;client_port=5000-5001")];
        assert_eq!(h.handle(&request("SETUP", uri, &udp)).status_code, 461);
        assert_eq!(h.handle(&request("SETUP", uri, &[])).status_code, 400);
    }

    #[test]
    fn record_without_announce_is_455() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        publish(&mut publisher, "/cam1");

        let (mut h, _) = handler(&ctx);
        let session = play(&mut h, "/cam1");
        let resp = h.handle(&request("RECORD", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 455);

        let resp = h.handle(&request(
            "SETUP",
            "rtsp://127.0.0.1/cam1/trackID=0",
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")],
        ));
        assert_eq!(resp.status_code, 455);
    }

    #[test]
    fn unknown_session_is_454() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        for method in ["PLAY", "RECORD", "PAUSE", "TEARDOWN"] {
            let resp = h.handle(&request(method, "rtsp://127.0.0.1/cam1", &[("Session", "00000000DEADBEEF")]));
            assert_eq!(resp.status_code, 454, "{method}");
        }
    }

    #[test]
    fn published_packet_reaches_player_once() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        publish(&mut publisher, "/cam1");

        let (mut player, out) = handler(&ctx);
        play(&mut player, "/cam1");

        let packet = test_packet(1, &[0xAB]);
        publisher.handle_interleaved(0, Bytes::copy_from_slice(packet.as_bytes()));

        let mut expected = vec![b'$', 0, 0, packet.len() as u8];
        expected.extend_from_slice(packet.as_bytes());
        assert_eq!(*out.0.lock(), expected);
        assert_eq!(ctx.registry.lookup("/cam1").unwrap().packets_forwarded(), 1);
    }

    #[test]
    fn pause_detaches_and_play_resumes() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        publish(&mut publisher, "/cam1");
        let stream = ctx.registry.lookup("/cam1").unwrap();

        let (mut player, out) = handler(&ctx);
        let session = play(&mut player, "/cam1");
        assert_eq!(stream.reader_count(), 1);

        let resp = player.handle(&request("PAUSE", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(stream.reader_count(), 0);

        publisher.handle_interleaved(0, Bytes::copy_from_slice(test_packet(2, &[]).as_bytes()));
        assert!(out.0.lock().is_empty());

        let resp = player.handle(&request("PLAY", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(stream.reader_count(), 1);
    }

    #[test]
    fn teardown_publisher_frees_path() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        let session = publish(&mut publisher, "/cam1");
        let stream = ctx.registry.lookup("/cam1").unwrap();

        let resp = publisher.handle(&request("TEARDOWN", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 200);
        assert!(ctx.registry.lookup("/cam1").is_none());
        assert!(stream.is_closed());
        assert!(ctx.sessions.is_empty());
        assert!(publisher.session_ids().is_empty());

        let resp = publisher.handle(&request("TEARDOWN", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 454);
    }

    #[test]
    fn second_announce_evicts_first_publisher() {
        let ctx = context();
        let (mut first, _) = handler(&ctx);
        let first_session = publish(&mut first, "/cam1");
        let old_stream = ctx.registry.lookup("/cam1").unwrap();

        let (mut second, _) = handler(&ctx);
        publish(&mut second, "/cam1");
        let new_stream = ctx.registry.lookup("/cam1").unwrap();
        assert!(old_stream.is_closed());
        assert!(!Arc::ptr_eq(&old_stream, &new_stream));

        // Disconnect of the evicted publisher must not take the path down.
        first.close_all_sessions();
        assert!(Arc::ptr_eq(&ctx.registry.lookup("/cam1").unwrap(), &new_stream));

        let id: SessionId = first_session.parse().unwrap();
        assert!(ctx.sessions.get_session(id).is_none());
    }

    #[test]
    fn reannounce_without_session_on_same_connection_replaces_publisher() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let first_session = publish(&mut h, "/cam1");
        let old_stream = ctx.registry.lookup("/cam1").unwrap();

        let announce = request("ANNOUNCE", "rtsp://127.0.0.1/cam1", &[]).with_body(H264_SDP.to_string());
        let resp = h.handle(&announce);
        assert_eq!(resp.status_code, 200);
        let second: SessionId = header(&resp, "Session").unwrap().parse().unwrap();
        let first: SessionId = first_session.parse().unwrap();
        assert_ne!(first, second);

        assert!(old_stream.is_closed());
        assert_eq!(ctx.registry.publisher_of("/cam1"), Some(second));
        assert!(!ctx.registry.lookup("/cam1").unwrap().is_closed());
        assert!(ctx.sessions.get_session(first).is_none());
        assert_eq!(h.session_ids(), vec![second]);

        // Interleaved channels of the finished publisher are released
        h.handle_interleaved(0, Bytes::from_static(&[0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert_eq!(ctx.registry.lookup("/cam1").unwrap().packets_forwarded(), 0);

        h.close_all_sessions();
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn record_on_superseded_stream_is_404() {
        let ctx = context();
        let (mut first, _) = handler(&ctx);
        let announce = request("ANNOUNCE", "rtsp://127.0.0.1/cam1", &[]).with_body(H264_SDP.to_string());
        let resp = first.handle(&announce);
        let session = header(&resp, "Session").unwrap().to_string();

        let (mut second, _) = handler(&ctx);
        publish(&mut second, "/cam1");

        let resp = first.handle(&request("RECORD", "rtsp://127.0.0.1/cam1", &[("Session", &session)]));
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn disconnect_cleans_up_player() {
        let ctx = context();
        let (mut publisher, _) = handler(&ctx);
        publish(&mut publisher, "/cam1");
        let stream = ctx.registry.lookup("/cam1").unwrap();

        let (mut player, _) = handler(&ctx);
        play(&mut player, "/cam1");
        assert_eq!(ctx.sessions.len(), 2);

        player.close_all_sessions();
        assert_eq!(stream.reader_count(), 0);
        assert_eq!(ctx.sessions.len(), 1);
        assert!(ctx.registry.lookup("/cam1").is_some());
    }

    #[test]
    fn get_parameter_keepalive() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let resp = h.handle(&request("GET_PARAMETER", "rtsp://127.0.0.1/cam1", &[]));
        assert_eq!(resp.status_code, 200);
        assert!(header(&resp, "Session").is_none());
    }

    #[test]
    fn unknown_method_is_501() {
        let ctx = context();
        let (mut h, _) = handler(&ctx);
        let resp = h.handle(&request("REDIRECT", "rtsp://127.0.0.1/cam1", &[]));
        assert_eq!(resp.status_code, 501);
        assert_eq!(header(&resp, "CSeq"), Some("7"));
    }

    #[test]
    fn default_interleaved_channels() {
        assert_eq!(default_channels(0), Some((0, 1)));
        assert_eq!(default_channels(1), Some((2, 3)));
        assert_eq!(default_channels(200), None);
    }
}
