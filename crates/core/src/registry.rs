//! Path → stream registry.
//!
//! The registry is the only place that decides who owns a path. Every
//! mutation (publish, replacement, unpublish) swaps entries under one
//! exclusive lock over the whole map, so a lookup sees either the state
//! before a mutation or the state after it. A replaced entry is closed after
//! the lock is released: closing a stream waits for its in-flight delivery,
//! and lookups on other paths must not wait with it.
//!
//! ```text
//!   ANNOUNCE /cam ──► publish ─┐   write lock
//!                              ├── swap in new entry
//!                              └── (unlocked) close old stream, old publisher
//!   DESCRIBE /cam ──► lookup       read lock (concurrent with other lookups)
//!   disconnect    ──► unpublish    write lock, no-op if superseded
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::media::{MediaDescription, RtpPacket};
use crate::session::SessionId;
use crate::stream::Stream;

/// What the registry keeps of a publisher session.
///
/// The registry never owns sessions. It compares identities during
/// [`StreamRegistry::unpublish`] and asks the session to close when a newer
/// publisher takes its path.
pub trait PublisherHandle: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Trigger the session's shutdown. Must not wait on network I/O.
    fn close(&self);
}

struct Entry {
    stream: Arc<Stream>,
    publisher: Arc<dyn PublisherHandle>,
}

/// Registry of active streams, keyed by path.
///
/// Cheap to clone: clones share the same map. Created by the
/// [`Server`](crate::Server) and handed to every connection.
#[derive(Clone)]
pub struct StreamRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Stream currently published on `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<Arc<Stream>> {
        self.entries.read().get(path).map(|e| e.stream.clone())
    }

    /// Resolve a SETUP URI to a stream and the track suffix that follows it.
    ///
    /// `rtsp://host/cam` resolves to (`/cam`, `None`),
    /// `rtsp://host/cam/trackID=0` to (`/cam`, `Some("trackID=0")`).
    pub fn resolve<'a>(&self, uri: &'a str) -> Option<(Arc<Stream>, Option<&'a str>)> {
        let path = extract_path(uri);
        if let Some(stream) = self.lookup(path) {
            return Some((stream, None));
        }
        let (parent, suffix) = split_last_segment(path)?;
        self.lookup(parent).map(|stream| (stream, Some(suffix)))
    }

    /// Bind a new stream to `path`, evicting any current publisher.
    ///
    /// The new entry replaces the old one atomically. The old stream is then
    /// closed (its readers unbound) and its publisher asked to close before
    /// this returns, outside the registry lock.
    pub fn publish(
        &self,
        path: &str,
        description: MediaDescription,
        publisher: Arc<dyn PublisherHandle>,
    ) -> Arc<Stream> {
        let stream = Arc::new(Stream::new(path, description));
        let publisher_id = publisher.session_id();

        let (previous, total_streams) = {
            let mut entries = self.entries.write();
            let previous = entries.insert(
                path.to_string(),
                Entry {
                    stream: stream.clone(),
                    publisher,
                },
            );
            (previous, entries.len())
        };

        if let Some(old) = previous {
            old.stream.close();
            let old_id = old.publisher.session_id();
            if old_id != publisher_id {
                old.publisher.close();
            }
            tracing::info!(
                path,
                evicted = %old_id,
                publisher = %publisher_id,
                "publisher replaced"
            );
        } else {
            tracing::info!(
                path,
                publisher = %publisher_id,
                tracks = %stream.description().summary(),
                total_streams,
                "stream published"
            );
        }

        stream
    }

    /// Remove the entry published by `session_id`, closing its stream.
    ///
    /// Returns the path that was freed. A session that publishes nothing, or
    /// whose entry was already replaced, leaves the registry untouched.
    pub fn unpublish(&self, session_id: SessionId) -> Option<String> {
        let (path, entry, remaining) = {
            let mut entries = self.entries.write();
            let path = entries
                .iter()
                .find(|(_, e)| e.publisher.session_id() == session_id)
                .map(|(path, _)| path.clone())?;
            let entry = entries.remove(&path);
            (path, entry, entries.len())
        };

        if let Some(entry) = entry {
            entry.stream.close();
        }
        tracing::info!(path, %session_id, remaining, "publisher disconnected");
        Some(path)
    }

    /// Forward a packet through an already resolved stream.
    ///
    /// Does not take the registry lock; the stream's own reader lock is the
    /// only synchronization on the packet path.
    pub fn forward(&self, stream: &Stream, track: usize, packet: &RtpPacket) -> Result<()> {
        stream.write(track, packet)
    }

    /// Session id of the publisher currently bound to `path`.
    pub fn publisher_of(&self, path: &str) -> Option<SessionId> {
        self.entries
            .read()
            .get(path)
            .map(|e| e.publisher.session_id())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Close every stream and publisher (server shutdown).
    pub fn close_all(&self) {
        let drained: Vec<Entry> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.stream.close();
            entry.publisher.close();
        }
        if !drained.is_empty() {
            tracing::info!(closed = drained.len(), "all streams closed");
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the path key from an RTSP URI.
///
/// `rtsp://host:8554/cam1`          → `/cam1`
/// `rtsp://host:8554/cam1/`         → `/cam1`
/// `rtsp://host:8554/cam1?token=x`  → `/cam1`
/// `rtsp://host:8554`               → `/`
/// `/cam1`                          → `/cam1`
pub fn extract_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        uri
    };

    let path = match path.find('?') {
        Some(q) => &path[..q],
        None => path,
    };

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// `/cam1/trackID=0` → (`/cam1`, `trackID=0`)
fn split_last_segment(path: &str) -> Option<(&str, &str)> {
    let slash = path.rfind('/')?;
    let (parent, suffix) = (&path[..slash], &path[slash + 1..]);
    if parent.is_empty() || suffix.is_empty() {
        return None;
    }
    Some((parent, suffix))
}
