use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::media::RtpPacket;
use crate::session::{Session, SessionId};

use super::MediaSink;

/// How often the receive threads wake up to check the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest datagram the relay accepts.
const MAX_DATAGRAM: usize = 65_535;

/// A publisher track expecting UDP datagrams from a given source address.
struct Source {
    session: Arc<Session>,
    track: usize,
}

/// UDP transport for RTP media.
///
/// Binds a fixed RTP/RTCP socket pair (advertised as `server_port` in SETUP
/// responses). Outbound player packets leave from the RTP socket; inbound
/// publisher packets arrive on it and are routed by source address to the
/// session that set up that address. Inbound RTCP is drained and dropped.
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_port: u16,
    rtcp_port: u16,
    sources: RwLock<HashMap<SocketAddr, Source>>,
}

impl UdpTransport {
    /// Bind the RTP and RTCP sockets.
    pub fn bind(rtp_addr: &str, rtcp_addr: &str) -> Result<Self> {
        let rtp = UdpSocket::bind(rtp_addr)?;
        let rtcp = UdpSocket::bind(rtcp_addr)?;
        let rtp_port = rtp.local_addr()?.port();
        let rtcp_port = rtcp.local_addr()?.port();
        tracing::info!(rtp_port, rtcp_port, "UDP transport bound");
        Ok(Self {
            rtp,
            rtcp,
            rtp_port,
            rtcp_port,
            sources: RwLock::new(HashMap::new()),
        })
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp_port
    }

    /// Route datagrams from `addr` to `track` of a recording session.
    pub fn register_source(&self, addr: SocketAddr, session: Arc<Session>, track: usize) {
        tracing::debug!(%addr, session_id = %session.id, track, "UDP source registered");
        self.sources.write().insert(addr, Source { session, track });
    }

    /// Forget every source registered by `session_id`.
    pub fn unregister_session(&self, session_id: SessionId) -> usize {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|_, s| s.session.id != session_id);
        before - sources.len()
    }

    /// Start the RTP receive thread and the RTCP drain thread. Both exit
    /// once `running` goes false.
    pub fn spawn_receivers(self: &Arc<Self>, running: Arc<AtomicBool>) -> Result<()> {
        self.rtp.set_read_timeout(Some(POLL_INTERVAL))?;
        self.rtcp.set_read_timeout(Some(POLL_INTERVAL))?;

        let transport = self.clone();
        let r = running.clone();
        thread::spawn(move || transport.rtp_loop(&r));

        let transport = self.clone();
        thread::spawn(move || transport.rtcp_loop(&running));
        Ok(())
    }

    fn rtp_loop(&self, running: &AtomicBool) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while running.load(Ordering::SeqCst) {
            let (len, from) = match self.rtp.recv_from(&mut buf) {
                Ok(r) => r,
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP RTP receive error");
                    continue;
                }
            };

            let target = self
                .sources
                .read()
                .get(&from)
                .map(|s| (s.session.clone(), s.track));
            let Some((session, track)) = target else {
                tracing::trace!(%from, len, "datagram from unknown source");
                continue;
            };

            match RtpPacket::parse(Bytes::copy_from_slice(&buf[..len])) {
                Ok(packet) => {
                    if !session.deliver(track, packet) {
                        tracing::trace!(session_id = %session.id, "packet before RECORD dropped");
                    }
                }
                Err(e) => tracing::debug!(%from, error = %e, "invalid RTP datagram"),
            }
        }
        tracing::debug!("UDP RTP receiver exited");
    }

    fn rtcp_loop(&self, running: &AtomicBool) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while running.load(Ordering::SeqCst) {
            match self.rtcp.recv_from(&mut buf) {
                Ok((len, from)) => tracing::trace!(%from, len, "RTCP dropped"),
                Err(ref e) if is_timeout(e) => {}
                Err(e) => tracing::debug!(error = %e, "UDP RTCP receive error"),
            }
        }
        tracing::debug!("UDP RTCP receiver exited");
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Player track delivered over UDP.
pub struct UdpSink {
    transport: Arc<UdpTransport>,
    addr: SocketAddr,
}

impl UdpSink {
    pub fn new(transport: Arc<UdpTransport>, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }
}

impl MediaSink for UdpSink {
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        self.transport.rtp.send_to(packet, self.addr).map(|_| ())
    }
}
