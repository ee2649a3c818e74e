//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is one client conversation on the relay, either a publisher
//! (ANNOUNCE → SETUP → RECORD) or a player (SETUP → PLAY). It tracks:
//!
//! - A random session ID (16 hex digits, returned in the `Session` header).
//! - The state machine below.
//! - The stream it announced or set up, and the per-track transports.
//! - For publishers, the packet handler bound at RECORD.
//!
//! ## Session lifecycle
//!
//! ```text
//! publisher:  Idle ─ANNOUNCE─► Announced ─RECORD─► Recording ─┐
//! player:     Idle ─SETUP────► Setup ─────PLAY───► Playing ───┤
//!                                 ▲                  │        │
//!                                 └──────PAUSE───────┘        ▼
//!                           TEARDOWN / disconnect / eviction ► Closed
//! ```

pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::media::RtpPacket;
use crate::registry::PublisherHandle;
use crate::stream::Stream;
use crate::transport::MediaSink;
pub use transport::Transport;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Identity of a session. Compared by value; carries no reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::random::<u64>())
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    /// Accepts the bare id or a `Session` header value with parameters
    /// (`0123456789ABCDEF;timeout=60`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = s.split(';').next().unwrap_or(s).trim();
        u64::from_str_radix(id, 16).map(Self)
    }
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Publisher sent ANNOUNCE; tracks may be SETUP.
    Announced,
    /// Publisher media is being forwarded.
    Recording,
    /// Player has set up at least one track.
    Setup,
    /// Player is attached to the stream.
    Playing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Announced => "announced",
            Self::Recording => "recording",
            Self::Setup => "setup",
            Self::Playing => "playing",
            Self::Closed => "closed",
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Announced)
                | (Announced, Announced)
                | (Announced, Recording)
                | (Idle, Setup)
                | (Setup, Setup)
                | (Setup, Playing)
                | (Playing, Playing)
                | (Playing, Setup)
                | (_, Closed)
        ) && self != Closed
    }

    pub fn is_publisher(self) -> bool {
        matches!(self, Self::Announced | Self::Recording)
    }
}

/// Callback invoked for every inbound packet of a recording session.
pub type PacketHandler = Arc<dyn Fn(usize, RtpPacket) + Send + Sync>;

/// A track set up on this session.
#[derive(Clone)]
pub struct TrackBinding {
    pub track: usize,
    pub transport: Transport,
    /// Outbound sink for players; `None` for publisher (inbound) tracks.
    pub sink: Option<Arc<dyn MediaSink>>,
}

/// A single relay session.
///
/// Created at ANNOUNCE or the first SETUP, finished by TEARDOWN,
/// disconnect or eviction. Interior mutability lets the connection thread,
/// the UDP ingest thread and the registry share it.
pub struct Session {
    pub id: SessionId,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    state: RwLock<SessionState>,
    stream: RwLock<Option<Arc<Stream>>>,
    tracks: RwLock<Vec<TrackBinding>>,
    on_packet: RwLock<Option<PacketHandler>>,
    /// Handle on the control connection, used to force the session off.
    connection: Option<TcpStream>,
    finished: AtomicBool,
}

impl Session {
    /// Create a session. `connection` is a clone of the RTSP control socket;
    /// it is only ever shut down, never read or written.
    pub fn new(connection: Option<TcpStream>) -> Self {
        Self {
            id: SessionId::random(),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            state: RwLock::new(SessionState::Idle),
            stream: RwLock::new(None),
            tracks: RwLock::new(Vec::new()),
            on_packet: RwLock::new(None),
            connection,
            finished: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Move to `next`, or fail with [`RelayError::InvalidState`].
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition(next) {
            return Err(RelayError::InvalidState {
                from: state.as_str(),
                to: next.as_str(),
            });
        }
        if *state != next {
            tracing::debug!(session_id = %self.id, from = state.as_str(), to = next.as_str(), "state transition");
        }
        *state = next;
        Ok(())
    }

    /// The stream this session announced (publisher) or set up (player).
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.read().clone()
    }

    pub fn set_stream(&self, stream: Arc<Stream>) {
        *self.stream.write() = Some(stream);
    }

    /// Record a SETUP. A repeated SETUP of the same track replaces it.
    pub fn bind_track(&self, binding: TrackBinding) {
        let mut tracks = self.tracks.write();
        tracks.retain(|b| b.track != binding.track);
        tracks.push(binding);
    }

    pub fn tracks(&self) -> Vec<TrackBinding> {
        self.tracks.read().clone()
    }

    /// Outbound sinks for [`Stream::attach`].
    pub fn sinks(&self) -> Vec<(usize, Arc<dyn MediaSink>)> {
        self.tracks
            .read()
            .iter()
            .filter_map(|b| b.sink.clone().map(|s| (b.track, s)))
            .collect()
    }

    pub fn set_packet_handler(&self, handler: PacketHandler) {
        *self.on_packet.write() = Some(handler);
    }

    /// Hand an inbound packet to the RECORD handler.
    ///
    /// Returns `false` when no handler is bound (not recording yet, or
    /// already closed); the packet is dropped.
    pub fn deliver(&self, track: usize, packet: RtpPacket) -> bool {
        let handler = self.on_packet.read().clone();
        match handler {
            Some(handler) => {
                handler(track, packet);
                true
            }
            None => false,
        }
    }

    /// Claim the one-time teardown of this session.
    ///
    /// Returns `true` for exactly one caller, however many paths (TEARDOWN,
    /// disconnect, eviction) race to end the session.
    pub fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.write() = SessionState::Closed;
        self.on_packet.write().take();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

impl PublisherHandle for Session {
    fn session_id(&self) -> SessionId {
        self.id
    }

    /// Stop forwarding and shut the control socket down. The connection
    /// thread sees the closed socket and runs the normal session cleanup.
    fn close(&self) {
        *self.state.write() = SessionState::Closed;
        self.on_packet.write().take();
        if let Some(conn) = &self.connection
            && let Err(e) = conn.shutdown(Shutdown::Both)
        {
            tracing::debug!(session_id = %self.id, error = %e, "shutdown of evicted session failed");
        }
        tracing::info!(session_id = %self.id, "session closed by relay");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("tracks", &self.tracks.read().len())
            .finish()
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock`; requests carrying a `Session` header
/// resolve through here.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create and register a new session.
    pub fn create_session(&self, connection: Option<TcpStream>) -> Arc<Session> {
        let session = Arc::new(Session::new(connection));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id, session.clone());
            sessions.len()
        };
        tracing::info!(session_id = %session.id, total_sessions = total, "session opened");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Remove and return a session by ID.
    pub fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(&id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::test_packet;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn session_id_round_trips_through_header() {
        let session = Session::new(None);
        let header = session.session_header_value();
        assert!(header.ends_with(";timeout=60"));
        assert_eq!(header.parse::<SessionId>().unwrap(), session.id);
        assert_eq!(SessionId::from_raw(1).to_string(), "0000000000000001");
    }

    #[test]
    fn session_id_rejects_garbage() {
        assert!("not-hex".parse::<SessionId>().is_err());
    }

    #[test]
    fn publisher_lifecycle() {
        let s = Session::new(None);
        s.transition(SessionState::Announced).unwrap();
        s.transition(SessionState::Announced).unwrap(); // SETUP per track
        s.transition(SessionState::Recording).unwrap();
        assert!(s.state().is_publisher());
        assert!(s.transition(SessionState::Playing).is_err());
    }

    #[test]
    fn player_lifecycle() {
        let s = Session::new(None);
        s.transition(SessionState::Setup).unwrap();
        s.transition(SessionState::Playing).unwrap();
        s.transition(SessionState::Setup).unwrap(); // PAUSE
        s.transition(SessionState::Playing).unwrap();
        assert!(s.transition(SessionState::Recording).is_err());
        assert!(s.transition(SessionState::Announced).is_err());
    }

    #[test]
    fn record_requires_announce() {
        let s = Session::new(None);
        let err = s.transition(SessionState::Recording).unwrap_err();
        assert!(matches!(err, RelayError::InvalidState { from: "idle", to: "recording" }));
    }

    #[test]
    fn closed_is_terminal() {
        let s = Session::new(None);
        assert!(s.finish());
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.transition(SessionState::Setup).is_err());
        assert!(s.transition(SessionState::Closed).is_err());
    }

    #[test]
    fn finish_runs_once() {
        let s = Session::new(None);
        assert!(s.finish());
        assert!(!s.finish());
        assert!(s.is_finished());
    }

    #[test]
    fn deliver_invokes_handler_until_closed() {
        let s = Session::new(None);
        assert!(!s.deliver(0, test_packet(1, &[])));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        s.set_packet_handler(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(s.deliver(0, test_packet(1, &[])));

        PublisherHandle::close(&s);
        assert!(!s.deliver(0, test_packet(2, &[])));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn manager_create_get_remove() {
        let manager = SessionManager::new();
        let s = manager.create_session(None);
        assert!(manager.get_session(s.id).is_some());
        assert_eq!(manager.len(), 1);
        assert!(manager.remove_session(s.id).is_some());
        assert!(manager.remove_session(s.id).is_none());
        assert!(manager.is_empty());
    }
}
