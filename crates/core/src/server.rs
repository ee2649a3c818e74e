use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::registry::StreamRegistry;
use crate::session::SessionManager;
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// Default RTSP listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8554";

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`) used when the publisher announced none.
    pub sdp_session_name: String,
    /// Shared UDP RTP socket address. `None` disables UDP transport; SETUP
    /// then only accepts TCP interleaved.
    pub udp_rtp_addr: Option<String>,
    /// Shared UDP RTCP socket address.
    pub udp_rtcp_addr: String,
    /// Write timeout on RTSP connections. A player that stops reading is
    /// dropped after this long instead of stalling its publisher.
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            udp_rtp_addr: Some("0.0.0.0:8000".to_string()),
            udp_rtcp_addr: "0.0.0.0:8001".to_string(),
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl ServerConfig {
    pub fn with_public_host(mut self, host: &str) -> Self {
        self.public_host = Some(host.to_string());
        self
    }

    pub fn with_session_name(mut self, name: &str) -> Self {
        self.sdp_session_name = name.to_string();
        self
    }

    pub fn with_udp(mut self, rtp_addr: &str, rtcp_addr: &str) -> Self {
        self.udp_rtp_addr = Some(rtp_addr.to_string());
        self.udp_rtcp_addr = rtcp_addr.to_string();
        self
    }

    pub fn without_udp(mut self) -> Self {
        self.udp_rtp_addr = None;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// State shared by every connection of a running server.
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub(crate) registry: StreamRegistry,
    pub(crate) sessions: SessionManager,
    pub(crate) udp: Option<Arc<UdpTransport>>,
    pub(crate) config: Arc<ServerConfig>,
}

/// RTSP relay server.
///
/// Owns the stream registry, the session manager and the UDP transport.
/// Delegates TCP connection handling to [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    registry: StreamRegistry,
    session_manager: SessionManager,
    running: Arc<AtomicBool>,
    bind_addr: String,
    udp: Option<Arc<UdpTransport>>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom transport/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            registry: StreamRegistry::new(),
            session_manager: SessionManager::new(),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            udp: None,
            config: Arc::new(config),
        }
    }

    /// Bind the listen socket (and the UDP pair, when enabled) and start
    /// accepting connections on a background thread.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        self.udp = match &self.config.udp_rtp_addr {
            Some(rtp_addr) => Some(Arc::new(UdpTransport::bind(
                rtp_addr,
                &self.config.udp_rtcp_addr,
            )?)),
            None => None,
        };

        self.running.store(true, Ordering::SeqCst);

        if let Some(udp) = &self.udp {
            udp.spawn_receivers(self.running.clone())?;
        }

        let context = RelayContext {
            registry: self.registry.clone(),
            sessions: self.session_manager.clone(),
            udp: self.udp.clone(),
            config: self.config.clone(),
        };
        let running = self.running.clone();

        tracing::info!(
            addr = %self.bind_addr,
            udp = self.udp.is_some(),
            "RTSP relay listening"
        );

        thread::spawn(move || {
            tcp::accept_loop(listener, context, running);
        });

        Ok(())
    }

    /// Stop accepting connections and close every published stream.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        self.registry.close_all();
        self.udp = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Port of the shared UDP RTP socket, once started with UDP enabled.
    pub fn udp_rtp_port(&self) -> Option<u16> {
        self.udp.as_ref().map(|u| u.rtp_port())
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
