use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::MethodHandler;
use crate::protocol::RtspRequest;
use crate::server::RelayContext;

use super::MediaSink;

/// Magic byte that starts an interleaved frame (RFC 2326 §10.12).
const INTERLEAVED_MAGIC: u8 = b'$';

/// Upper bound on an RTSP request head, to stop a client that never sends
/// the blank line.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub(crate) fn accept_loop(listener: TcpListener, context: RelayContext, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = context.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, ctx, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Write half of an RTSP connection.
///
/// Shared between the connection thread (responses) and publisher delivery
/// threads (interleaved RTP to players); the mutex keeps each response or
/// frame contiguous on the wire.
///
/// A failed write may leave part of a frame on the wire, so the first
/// failure marks the writer broken and shuts the socket down. Every later
/// write fails immediately with `BrokenPipe`.
#[derive(Clone)]
pub struct ConnectionWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    out: Mutex<Box<dyn Write + Send>>,
    socket: Option<TcpStream>,
    broken: AtomicBool,
}

impl ConnectionWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self::build(Box::new(writer), None)
    }

    /// Writer over a connected socket; a write failure shuts the socket
    /// down so the connection's read loop exits as well.
    pub fn for_socket(socket: TcpStream) -> io::Result<Self> {
        let control = socket.try_clone()?;
        Ok(Self::build(Box::new(socket), Some(control)))
    }

    fn build(out: Box<dyn Write + Send>, socket: Option<TcpStream>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                out: Mutex::new(out),
                socket,
                broken: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a previous write failed.
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut w = self.inner.out.lock();
        self.check_broken()?;
        let result = w.write_all(data).and_then(|()| w.flush());
        self.settle(result)
    }

    /// Write `$ <channel> <len:u16> <payload>` as one frame.
    pub fn write_interleaved(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "interleaved payload too large")
        })?;
        let [hi, lo] = len.to_be_bytes();

        let mut w = self.inner.out.lock();
        self.check_broken()?;
        let result = w
            .write_all(&[INTERLEAVED_MAGIC, channel, hi, lo])
            .and_then(|()| w.write_all(payload))
            .and_then(|()| w.flush());
        self.settle(result)
    }

    fn check_broken(&self) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection writer broken"));
        }
        Ok(())
    }

    fn settle(&self, result: io::Result<()>) -> io::Result<()> {
        if let Err(e) = &result
            && !self.inner.broken.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(error = %e, "connection write failed, closing connection");
            if let Some(socket) = &self.inner.socket {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
        result
    }
}

/// Player track delivered interleaved on the player's RTSP connection.
pub struct InterleavedSink {
    writer: ConnectionWriter,
    channel: u8,
}

impl InterleavedSink {
    pub fn new(writer: ConnectionWriter, channel: u8) -> Self {
        Self { writer, channel }
    }
}

impl MediaSink for InterleavedSink {
    fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
        self.writer.write_interleaved(self.channel, packet)
    }

    fn is_closed(&self) -> bool {
        self.writer.is_broken()
    }
}

/// One unit read off the control connection.
enum Incoming {
    Request(RtspRequest),
    Interleaved { channel: u8, payload: Bytes },
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: ConnectionWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, context: RelayContext, running: Arc<AtomicBool>) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
        }
        if let Err(e) = stream.set_write_timeout(context.config.write_timeout) {
            tracing::debug!(%peer_addr, error = %e, "failed to set write timeout");
        }

        let (reader_stream, writer) = match (
            stream.try_clone(),
            stream.try_clone().and_then(ConnectionWriter::for_socket),
        ) {
            (Ok(r), Ok(w)) => (r, w),
            _ => return,
        };

        tracing::info!(%peer_addr, "connection opened");

        let handler = MethodHandler::new(context, peer_addr, writer.clone(), Some(stream));

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.handler.close_all_sessions();

        tracing::info!(%peer_addr, reason, "connection closed");
    }

    /// Request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let incoming = match self.read_incoming() {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return "connection closed by client",
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "malformed request");
                    return "protocol error";
                }
                Err(_) => return "read error",
            };

            let request = match incoming {
                Incoming::Interleaved { channel, payload } => {
                    self.handler.handle_interleaved(channel, payload);
                    continue;
                }
                Incoming::Request(request) => request,
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                cseq = request.cseq().unwrap_or("-"),
                "request"
            );

            let response = self.handler.handle(&request);

            tracing::debug!(
                peer = %self.peer_addr,
                status = response.status_code,
                "response"
            );

            if self
                .writer
                .write_all(response.serialize().as_bytes())
                .is_err()
            {
                return "write error";
            }
        }

        "server shutting down"
    }

    /// Read the next interleaved frame or RTSP request. `Ok(None)` on EOF.
    fn read_incoming(&mut self) -> io::Result<Option<Incoming>> {
        loop {
            let first = match self.reader.fill_buf()? {
                [] => return Ok(None),
                buf => buf[0],
            };

            if first == INTERLEAVED_MAGIC {
                let mut header = [0u8; 4];
                self.reader.read_exact(&mut header)?;
                let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let mut payload = vec![0u8; len];
                self.reader.read_exact(&mut payload)?;
                return Ok(Some(Incoming::Interleaved {
                    channel: header[1],
                    payload: Bytes::from(payload),
                }));
            }

            let Some(head) = self.read_head()? else {
                return Ok(None);
            };
            if head.trim().is_empty() {
                continue;
            }

            let request = RtspRequest::parse(&head)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let len = request
                .content_length()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            if len == 0 {
                return Ok(Some(Incoming::Request(request)));
            }
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body)?;
            let body = String::from_utf8_lossy(&body).into_owned();
            return Ok(Some(Incoming::Request(request.with_body(body))));
        }
    }

    /// Read header lines up to and including the blank line.
    fn read_head(&mut self) -> io::Result<Option<String>> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let blank = line == "\r\n" || line == "\n";
            head.push_str(&line);
            if blank {
                return Ok(Some(head));
            }
            if head.len() > MAX_HEAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::media::rtp::test_packet;
    use crate::media::{MediaDescription, MediaKind, Track};
    use crate::session::SessionId;
    use crate::stream::Stream;
    use crate::stream::tests::RecordingSink;
    use std::time::Instant;

    /// `Write` into a buffer the test can inspect.
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

    #[test]
    fn interleaved_frame_layout() {
        let buf = SharedBuf::default();
        let writer = ConnectionWriter::new(buf.clone());
        writer.write_interleaved(2, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(*buf.0.lock(), vec![b'$', 2, 0, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn oversized_interleaved_payload_rejected() {
        let writer = ConnectionWriter::new(SharedBuf::default());
        let err = writer
            .write_interleaved(0, &vec![0u8; 70_000])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn sink_writes_on_its_channel() {
        let buf = SharedBuf::default();
        let sink = InterleavedSink::new(ConnectionWriter::new(buf.clone()), 4);
        sink.send_rtp(&[1, 2]).unwrap();
        sink.send_rtp(&[3]).unwrap();
        assert_eq!(*buf.0.lock(), vec![b'$', 4, 0, 2, 1, 2, b'$', 4, 0, 1, 3]);
    }

    /// Writer that fails every write, for checking the broken state.
    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_failure_breaks_writer() {
        let writer = ConnectionWriter::new(FailingWriter);
        let sink = InterleavedSink::new(writer.clone(), 0);
        assert!(!sink.is_closed());

        let err = sink.send_rtp(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(writer.is_broken());
        assert!(sink.is_closed());

        let err = writer.write_all(b"RTSP/1.0 200 OK\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn stalled_player_socket_is_dropped_from_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // Connected but never reads
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side
            .set_write_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let writer = ConnectionWriter::for_socket(server_side).unwrap();

        let stream = Stream::new(
            "/cam",
            MediaDescription::new(vec![Track::new(MediaKind::Video, 96, "H264", 90000)]),
        );
        let stalled = Arc::new(InterleavedSink::new(writer.clone(), 0));
        let healthy = Arc::new(RecordingSink::default());
        stream
            .attach(SessionId::from_raw(1), vec![(0, stalled as Arc<dyn MediaSink>)])
            .unwrap();
        stream
            .attach(SessionId::from_raw(2), vec![(0, healthy.clone() as Arc<dyn MediaSink>)])
            .unwrap();

        let payload = vec![0u8; 60_000];
        let mut seq = 0u16;
        loop {
            seq += 1;
            match stream.write(0, &test_packet(seq, &payload)) {
                Ok(()) => assert!(seq < 1000, "socket buffers never filled"),
                Err(RelayError::ForwardFailed { failed: 1, .. }) => break,
                Err(e) => panic!("unexpected forward error: {e}"),
            }
        }

        assert!(writer.is_broken());
        assert_eq!(stream.reader_count(), 1);

        // Later packets no longer wait on the dead socket
        for _ in 0..5 {
            seq += 1;
            let started = Instant::now();
            stream.write(0, &test_packet(seq, &[])).unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));
        }
        assert_eq!(*healthy.received.lock(), (1..=seq).collect::<Vec<u16>>());
        drop(peer);
    }
}
