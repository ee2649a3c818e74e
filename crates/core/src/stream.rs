//! Per-path fan-out.
//!
//! A [`Stream`] is created by [`StreamRegistry::publish`](crate::StreamRegistry::publish)
//! and lives until the publisher disconnects or is evicted. It holds the
//! announced [`MediaDescription`] and the set of readers (players) that
//! receive every packet the publisher sends.
//!
//! ```text
//!   publisher thread            Stream                    readers
//!   ────────────────      ┌──────────────────┐
//!   write(track, pkt) ──► │ closed?          │ ──► sink[track].send_rtp()  (player A)
//!                         │ readers (RwLock) │ ──► sink[track].send_rtp()  (player B)
//!                         └──────────────────┘
//! ```
//!
//! `write` holds only the reader list's read lock, so players attaching or
//! detaching never race a half-delivered packet and the registry lock is
//! never involved. Readers whose connection is gone are dropped right after
//! the delivery that found them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::media::{MediaDescription, RtpPacket};
use crate::session::SessionId;
use crate::transport::MediaSink;

/// A player attached to a stream: one optional sink per track.
struct Reader {
    session_id: SessionId,
    sinks: Vec<Option<Arc<dyn MediaSink>>>,
}

/// One active media source on a path.
pub struct Stream {
    path: String,
    description: MediaDescription,
    closed: AtomicBool,
    readers: RwLock<Vec<Reader>>,
    packets_forwarded: AtomicU64,
}

impl Stream {
    pub fn new(path: &str, description: MediaDescription) -> Self {
        Self {
            path: path.to_string(),
            description,
            closed: AtomicBool::new(false),
            readers: RwLock::new(Vec::new()),
            packets_forwarded: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The media description fixed at creation.
    pub fn description(&self) -> &MediaDescription {
        &self.description
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Packets accepted by [`write`](Self::write) since creation.
    pub fn packets_forwarded(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }

    /// Attach a player. `sinks` pairs track indices with the transport the
    /// player negotiated for that track during SETUP. Re-attaching the same
    /// session replaces its sinks.
    pub fn attach(&self, session_id: SessionId, sinks: Vec<(usize, Arc<dyn MediaSink>)>) -> Result<()> {
        let mut readers = self.readers.write();
        if self.is_closed() {
            return Err(RelayError::StreamClosed(self.path.clone()));
        }

        let mut by_track: Vec<Option<Arc<dyn MediaSink>>> = vec![None; self.description.tracks.len()];
        for (track, sink) in sinks {
            match by_track.get_mut(track) {
                Some(slot) => *slot = Some(sink),
                None => {
                    return Err(RelayError::UnknownTrack {
                        path: self.path.clone(),
                        track,
                    });
                }
            }
        }

        readers.retain(|r| r.session_id != session_id);
        readers.push(Reader {
            session_id,
            sinks: by_track,
        });
        tracing::debug!(path = %self.path, %session_id, readers = readers.len(), "reader attached");
        Ok(())
    }

    /// Detach a player. Returns whether it was attached.
    pub fn detach(&self, session_id: SessionId) -> bool {
        let mut readers = self.readers.write();
        match readers.iter().position(|r| r.session_id == session_id) {
            Some(pos) => {
                readers.swap_remove(pos);
                tracing::debug!(path = %self.path, %session_id, readers = readers.len(), "reader detached");
                true
            }
            None => false,
        }
    }

    /// Forward one packet of `track` to every reader that set that track up.
    ///
    /// Readers are visited in attach order and each send completes before the
    /// next, so per-track ordering is the order of `write` calls. A reader
    /// whose sink fails is skipped; the others still receive the packet and
    /// the failure count is reported as [`RelayError::ForwardFailed`]. A
    /// failed reader whose sink reports [`MediaSink::is_closed`] is detached
    /// once delivery is done.
    pub fn write(&self, track: usize, packet: &RtpPacket) -> Result<()> {
        if track >= self.description.tracks.len() {
            return Err(RelayError::UnknownTrack {
                path: self.path.clone(),
                track,
            });
        }

        let mut failed = 0;
        let mut dead = Vec::new();
        {
            // `closed` only flips under the write lock, so holding the read
            // lock pins it for the whole delivery.
            let readers = self.readers.read();
            if self.is_closed() {
                return Err(RelayError::StreamClosed(self.path.clone()));
            }
            for reader in readers.iter() {
                let Some(sink) = &reader.sinks[track] else {
                    continue;
                };
                if let Err(e) = sink.send_rtp(packet.as_bytes()) {
                    tracing::debug!(
                        path = %self.path,
                        session_id = %reader.session_id,
                        track,
                        error = %e,
                        "reader send failed"
                    );
                    failed += 1;
                    if sink.is_closed() {
                        dead.push(reader.session_id);
                    }
                }
            }
            self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        }

        if !dead.is_empty() {
            self.detach_dead(&dead);
        }

        if failed > 0 {
            return Err(RelayError::ForwardFailed {
                path: self.path.clone(),
                failed,
            });
        }
        Ok(())
    }

    fn detach_dead(&self, dead: &[SessionId]) {
        let mut readers = self.readers.write();
        readers.retain(|r| !dead.contains(&r.session_id));
        for session_id in dead {
            tracing::warn!(
                path = %self.path,
                %session_id,
                readers = readers.len(),
                "reader connection lost, detached"
            );
        }
    }

    /// Mark the stream terminal and unbind every reader.
    ///
    /// Idempotent: returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let mut readers = self.readers.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let unbound = readers.len();
        readers.clear();
        tracing::info!(
            path = %self.path,
            readers_unbound = unbound,
            packets = self.packets_forwarded(),
            "stream closed"
        );
        true
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("path", &self.path)
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .field("readers", &self.reader_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::rtp::test_packet;
    use crate::media::{MediaKind, Track};
    use parking_lot::Mutex;
    use std::io;

    /// Sink that records the sequence numbers it receives. `fail` makes
    /// sends error; `gone` additionally reports the sink closed.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub received: Mutex<Vec<u16>>,
        pub fail: AtomicBool,
        pub gone: AtomicBool,
    }

    impl MediaSink for RecordingSink {
        fn send_rtp(&self, packet: &[u8]) -> io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.received
                .lock()
                .push(u16::from_be_bytes([packet[2], packet[3]]));
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.gone.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn two_tracks() -> MediaDescription {
        MediaDescription::new(vec![
            Track::new(MediaKind::Video, 96, "H264", 90000),
            Track::new(MediaKind::Audio, 97, "OPUS", 48000),
        ])
    }

    fn sid(n: u64) -> SessionId {
        SessionId::from_raw(n)
    }

    #[test]
    fn write_preserves_order_per_track() {
        let stream = Stream::new("/cam", two_tracks());
        let sink = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, sink.clone() as Arc<dyn MediaSink>)]).unwrap();

        for seq in 1..=5 {
            stream.write(0, &test_packet(seq, &[])).unwrap();
        }
        // Audio track not set up by this reader
        stream.write(1, &test_packet(100, &[])).unwrap();

        assert_eq!(*sink.received.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.packets_forwarded(), 6);
    }

    #[test]
    fn fan_out_to_every_reader() {
        let stream = Stream::new("/cam", two_tracks());
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, a.clone() as Arc<dyn MediaSink>)]).unwrap();
        stream.attach(sid(2), vec![(0, b.clone() as Arc<dyn MediaSink>)]).unwrap();

        stream.write(0, &test_packet(1, &[])).unwrap();

        assert_eq!(*a.received.lock(), vec![1]);
        assert_eq!(*b.received.lock(), vec![1]);
    }

    #[test]
    fn failing_reader_does_not_block_others() {
        let stream = Stream::new("/cam", two_tracks());
        let bad = Arc::new(RecordingSink::default());
        bad.fail.store(true, Ordering::SeqCst);
        let good = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, bad as Arc<dyn MediaSink>)]).unwrap();
        stream.attach(sid(2), vec![(0, good.clone() as Arc<dyn MediaSink>)]).unwrap();

        let err = stream.write(0, &test_packet(1, &[])).unwrap_err();
        assert!(matches!(err, RelayError::ForwardFailed { failed: 1, .. }));
        assert_eq!(*good.received.lock(), vec![1]);

        // Stream stays usable
        assert!(!stream.is_closed());
    }

    #[test]
    fn transient_failure_keeps_reader_attached() {
        let stream = Stream::new("/cam", two_tracks());
        let flaky = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, flaky.clone() as Arc<dyn MediaSink>)]).unwrap();

        flaky.fail.store(true, Ordering::SeqCst);
        assert!(stream.write(0, &test_packet(1, &[])).is_err());
        assert_eq!(stream.reader_count(), 1);

        flaky.fail.store(false, Ordering::SeqCst);
        stream.write(0, &test_packet(2, &[])).unwrap();
        assert_eq!(*flaky.received.lock(), vec![2]);
    }

    #[test]
    fn lost_reader_detached_and_others_keep_receiving() {
        let stream = Stream::new("/cam", two_tracks());
        let lost = Arc::new(RecordingSink::default());
        let good = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, lost.clone() as Arc<dyn MediaSink>)]).unwrap();
        stream.attach(sid(2), vec![(0, good.clone() as Arc<dyn MediaSink>)]).unwrap();

        stream.write(0, &test_packet(1, &[])).unwrap();
        lost.fail.store(true, Ordering::SeqCst);
        lost.gone.store(true, Ordering::SeqCst);

        let err = stream.write(0, &test_packet(2, &[])).unwrap_err();
        assert!(matches!(err, RelayError::ForwardFailed { failed: 1, .. }));
        assert_eq!(stream.reader_count(), 1);
        assert!(!stream.detach(sid(1)));

        for seq in 3..=50 {
            stream.write(0, &test_packet(seq, &[])).unwrap();
        }
        assert_eq!(*good.received.lock(), (1..=50).collect::<Vec<u16>>());
        assert_eq!(*lost.received.lock(), vec![1]);
        assert!(!stream.is_closed());
    }

    #[test]
    fn unknown_track_rejected() {
        let stream = Stream::new("/cam", two_tracks());
        assert!(matches!(
            stream.write(2, &test_packet(1, &[])),
            Err(RelayError::UnknownTrack { track: 2, .. })
        ));
        let sink = Arc::new(RecordingSink::default());
        assert!(stream.attach(sid(1), vec![(5, sink as Arc<dyn MediaSink>)]).is_err());
    }

    #[test]
    fn close_is_idempotent_and_rejects_writes() {
        let stream = Stream::new("/cam", two_tracks());
        let sink = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, sink.clone() as Arc<dyn MediaSink>)]).unwrap();

        assert!(stream.close());
        assert!(!stream.close());
        assert!(stream.is_closed());
        assert_eq!(stream.reader_count(), 0);

        assert!(matches!(
            stream.write(0, &test_packet(1, &[])),
            Err(RelayError::StreamClosed(_))
        ));
        assert!(matches!(
            stream.attach(sid(2), vec![]),
            Err(RelayError::StreamClosed(_))
        ));
        assert!(sink.received.lock().is_empty());
    }

    #[test]
    fn reattach_replaces_and_detach() {
        let stream = Stream::new("/cam", two_tracks());
        let sink = Arc::new(RecordingSink::default());
        stream.attach(sid(1), vec![(0, sink.clone() as Arc<dyn MediaSink>)]).unwrap();
        stream.attach(sid(1), vec![(0, sink.clone() as Arc<dyn MediaSink>)]).unwrap();
        assert_eq!(stream.reader_count(), 1);

        stream.write(0, &test_packet(1, &[])).unwrap();
        assert_eq!(*sink.received.lock(), vec![1]);

        assert!(stream.detach(sid(1)));
        assert!(!stream.detach(sid(1)));
        stream.write(0, &test_packet(2, &[])).unwrap();
        assert_eq!(*sink.received.lock(), vec![1]);
    }
}
