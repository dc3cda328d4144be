//! Session registry: terminal sessions keyed by `(owner_id, session_id)`.
//!
//! A session is created when the agent-side wrapper connects upstream and is
//! the fan-out point between exactly one upstream and any number of viewers.
//! Output is appended to a bounded [`HistoryRing`] and broadcast to viewers;
//! viewer keystrokes and resize requests travel back through the upstream
//! handle. Ended sessions linger until the reaper drops them, so viewers can
//! still read scrollback and a reconnecting wrapper can resurrect the entry
//! with history intact.
//!
//! Locking: per-session state sits behind a `std::sync::Mutex` that is never
//! held across an await. Fan-out uses a `tokio::sync::broadcast` channel, so
//! ingestion is O(1) in the number of viewers and a slow viewer lags (and is
//! dropped by its connection task) instead of blocking upstream.

use crate::frame::{self, FRAME_TYPE_INPUT, FRAME_TYPE_RESIZE};
use crate::history::HistoryRing;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Per-session broadcast capacity (events buffered per lagging viewer).
pub const LIVE_BROADCAST_CAP: usize = 256;

/// Default PTY size until upstream reports one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Unix timestamp for "now" (seconds).
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry key: sessions are scoped under the owning identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub owner_id: String,
    pub session_id: String,
}

/// Events fanned out to viewer connections.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw terminal bytes, already appended to history.
    Output(Bytes),
    /// Authoritative window size change.
    Resize { cols: u16, rows: u16 },
    /// Upstream is gone and the session is inactive.
    Ended,
}

/// Write half of the upstream connection: pre-framed bytes destined for the
/// agent socket. Replaced wholesale when the wrapper reconnects.
pub type UpstreamSender = mpsc::Sender<Vec<u8>>;

/// Everything a joining viewer needs: the history snapshot, the size to
/// announce, and a live receiver subscribed atomically with the snapshot so
/// delivery is history-then-live with no gap and no duplicate.
pub struct SessionJoin {
    pub history: Vec<Bytes>,
    pub cols: u16,
    pub rows: u16,
    pub events: broadcast::Receiver<SessionEvent>,
}

/// Session list entry (viewer handshake and `GET /api/v1/sessions`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub active: bool,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub cols: u16,
    pub rows: u16,
}

struct SessionState {
    api_key_hash: String,
    cols: u16,
    rows: u16,
    is_active: bool,
    ended_at: Option<u64>,
    last_heartbeat: u64,
    history: HistoryRing,
    upstream: Option<UpstreamSender>,
}

/// One CLI session flowing through the relay.
pub struct Session {
    owner_id: String,
    session_id: String,
    started_at: u64,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(owner_id: String, session_id: String, api_key_hash: String, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(LIVE_BROADCAST_CAP);
        Self {
            owner_id,
            session_id,
            started_at: unix_now_secs(),
            events,
            state: Mutex::new(SessionState {
                api_key_hash,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                is_active: true,
                ended_at: None,
                last_heartbeat: unix_now_secs(),
                history: HistoryRing::new(history_limit),
                upstream: None,
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Associate the unique upstream handle, replacing any stale one.
    pub fn attach_upstream(&self, upstream: UpstreamSender) {
        self.lock().upstream = Some(upstream);
    }

    /// Drop the upstream handle.
    pub fn detach_upstream(&self) {
        self.lock().upstream = None;
    }

    /// Append terminal output to history and broadcast it to viewers.
    ///
    /// Empty chunks are a no-op. Appends after `end()` are accepted (late
    /// flushes from a closing wrapper); the session stays inactive.
    pub fn append_output(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.history.push(chunk.clone());
        state.last_heartbeat = unix_now_secs();
        let _ = self.events.send(SessionEvent::Output(chunk));
    }

    /// Ship viewer keystrokes upstream as an INPUT frame.
    ///
    /// Silently dropped when no upstream is attached; a viewer typing at a
    /// detached session is not an error.
    pub fn forward_input(&self, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        let Some(upstream) = state.upstream.clone() else {
            return;
        };
        let frame = frame::pack_frame(FRAME_TYPE_INPUT, data.as_bytes());
        if let Err(err) = upstream.try_send(frame) {
            match err {
                mpsc::error::TrySendError::Closed(_) => state.upstream = None,
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!(
                        "upstream send queue full, dropping input session={}:{}",
                        self.owner_id,
                        self.session_id
                    );
                }
            }
        }
    }

    /// Viewer-originated resize. Missing dimensions fall back to the current
    /// size; if nothing changes no frame is sent and no event broadcast.
    pub fn request_resize(&self, cols: Option<u16>, rows: Option<u16>) {
        let mut state = self.lock();
        let Some(upstream) = state.upstream.clone() else {
            return;
        };
        let cols = cols.unwrap_or(state.cols);
        let rows = rows.unwrap_or(state.rows);
        if cols == 0 || rows == 0 {
            return;
        }
        if cols == state.cols && rows == state.rows {
            return;
        }

        let frame = frame::pack_frame(FRAME_TYPE_RESIZE, &frame::encode_resize(rows, cols));
        match upstream.try_send(frame) {
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.upstream = None;
                return;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "upstream send queue full, dropping resize session={}:{}",
                    self.owner_id,
                    self.session_id
                );
            }
            Ok(()) => {}
        }
        state.cols = cols;
        state.rows = rows;
        let _ = self.events.send(SessionEvent::Resize { cols, rows });
    }

    /// Authoritative size report from upstream; broadcast only on change.
    pub fn update_size(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let mut state = self.lock();
        state.last_heartbeat = unix_now_secs();
        if state.cols == cols && state.rows == rows {
            return;
        }
        state.cols = cols;
        state.rows = rows;
        let _ = self.events.send(SessionEvent::Resize { cols, rows });
    }

    /// Mark the session inactive and tell every viewer. Idempotent.
    pub fn end(&self) {
        let mut state = self.lock();
        if !state.is_active {
            return;
        }
        state.is_active = false;
        state.ended_at = Some(unix_now_secs());
        state.upstream = None;
        let _ = self.events.send(SessionEvent::Ended);
    }

    /// Atomically snapshot history and subscribe to live events.
    ///
    /// The lock is held across both, so every output chunk lands either in
    /// the snapshot or in the subscription, never both and never neither.
    pub fn join(&self) -> SessionJoin {
        let state = self.lock();
        SessionJoin {
            history: state.history.snapshot(),
            cols: state.cols,
            rows: state.rows,
            events: self.events.subscribe(),
        }
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        let state = self.lock();
        SessionDescriptor {
            id: self.session_id.clone(),
            active: state.is_active,
            started_at: self.started_at,
            ended_at: state.ended_at,
            cols: state.cols,
            rows: state.rows,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active
    }

    pub fn ended_at(&self) -> Option<u64> {
        self.lock().ended_at
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.lock().last_heartbeat
    }

    pub fn history_bytes(&self) -> usize {
        self.lock().history.total_bytes()
    }

    fn matches_hash(&self, api_key_hash: Option<&str>) -> bool {
        match api_key_hash {
            None => true,
            Some(hash) => self.lock().api_key_hash == hash,
        }
    }

    /// Reactivate on wrapper reconnect. History is preserved; any stale
    /// upstream handle is discarded and the creating key recorded anew.
    fn resurrect(&self, api_key_hash: String) {
        let mut state = self.lock();
        state.api_key_hash = api_key_hash;
        state.is_active = true;
        state.ended_at = None;
        state.upstream = None;
    }

    fn reapable_at(&self, now: u64, retention_secs: u64) -> bool {
        let state = self.lock();
        if state.is_active {
            return false;
        }
        match state.ended_at {
            Some(ended_at) => now.saturating_sub(ended_at) > retention_secs,
            None => false,
        }
    }
}

/// Process-wide registry of active and recently-ended sessions.
///
/// Construct once and inject into endpoint handlers; the sharded map is the
/// only shared mutable state in the relay.
pub struct SessionManager {
    sessions: DashMap<SessionKey, Arc<Session>>,
    history_limit: usize,
    ended_retention_secs: u64,
}

impl SessionManager {
    pub fn new(history_limit: usize, ended_retention_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            history_limit,
            ended_retention_secs,
        }
    }

    /// Register a session for an authenticated upstream, resurrecting (with
    /// history preserved) if the key already exists.
    pub fn create(&self, owner_id: &str, session_id: &str, api_key_hash: &str) -> Arc<Session> {
        let key = SessionKey {
            owner_id: owner_id.to_string(),
            session_id: session_id.to_string(),
        };
        match self.sessions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                session.resurrect(api_key_hash.to_string());
                session
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(
                    owner_id.to_string(),
                    session_id.to_string(),
                    api_key_hash.to_string(),
                    self.history_limit,
                ));
                entry.insert(Arc::clone(&session));
                session
            }
        }
    }

    /// Look up a session the caller may see: present, and either the caller
    /// has no key hash (bearer viewer) or the hash matches the creating key.
    pub fn get(&self, owner_id: &str, session_id: &str, api_key_hash: Option<&str>) -> Option<Arc<Session>> {
        let key = SessionKey {
            owner_id: owner_id.to_string(),
            session_id: session_id.to_string(),
        };
        let session = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()))?;
        session.matches_hash(api_key_hash).then_some(session)
    }

    /// All sessions of `owner_id` visible under the given key hash.
    pub fn sessions_for(&self, owner_id: &str, api_key_hash: Option<&str>) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().owner_id == owner_id && entry.value().matches_hash(api_key_hash))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Idempotent end; a miss is not an error.
    pub fn end(&self, owner_id: &str, session_id: &str) {
        if let Some(session) = self.get(owner_id, session_id, None) {
            session.end();
        }
    }

    /// Drop every session that ended longer than the retention window ago.
    /// Active sessions are never reaped. Returns the number removed.
    pub fn reap_inactive(&self) -> usize {
        self.reap_inactive_at(unix_now_secs())
    }

    pub fn reap_inactive_at(&self, now: u64) -> usize {
        let before = self.sessions.len();
        let retention = self.ended_retention_secs;
        self.sessions.retain(|_, session| !session.reapable_at(now, retention));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;
    use tokio::sync::broadcast::error::TryRecvError;

    fn manager() -> SessionManager {
        SessionManager::new(1024, 900)
    }

    fn decode_one(frame_bytes: &[u8]) -> (u8, Bytes) {
        let mut buf = FrameBuffer::new();
        buf.extend(frame_bytes);
        buf.next_frame().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_then_create_resurrects_same_session() {
        let mgr = manager();
        let first = mgr.create("owner", "s1", "hash-a");
        first.append_output(Bytes::from_static(b"kept"));
        first.end();
        assert!(!first.is_active());

        let second = mgr.create("owner", "s1", "hash-b");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_active());
        assert_eq!(second.ended_at(), None);
        // History survives the reconnect.
        assert_eq!(second.join().history, vec![Bytes::from_static(b"kept")]);
        // The stored hash was overwritten by the new key.
        assert!(mgr.get("owner", "s1", Some("hash-b")).is_some());
        assert!(mgr.get("owner", "s1", Some("hash-a")).is_none());
    }

    #[tokio::test]
    async fn test_resurrect_detaches_stale_upstream() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);
        mgr.create("owner", "s1", "hash");
        session.forward_input("typed");
        assert!(rx.try_recv().is_err(), "stale upstream must not receive input");
    }

    #[tokio::test]
    async fn test_get_respects_hash_scoping() {
        let mgr = manager();
        mgr.create("owner", "s1", "hash-a");
        assert!(mgr.get("owner", "s1", Some("hash-a")).is_some());
        assert!(mgr.get("owner", "s1", Some("hash-x")).is_none());
        // Bearer viewers (no hash) see every session of the owner.
        assert!(mgr.get("owner", "s1", None).is_some());
        assert!(mgr.get("other", "s1", None).is_none());
    }

    #[tokio::test]
    async fn test_sessions_for_filters_by_owner_and_hash() {
        let mgr = manager();
        mgr.create("owner", "s1", "hash-a");
        mgr.create("owner", "s2", "hash-b");
        mgr.create("intruder", "s3", "hash-a");

        let keyed: Vec<String> = mgr
            .sessions_for("owner", Some("hash-a"))
            .iter()
            .map(|s| s.session_id().to_string())
            .collect();
        assert_eq!(keyed, vec!["s1".to_string()]);

        let mut bearer: Vec<String> = mgr
            .sessions_for("owner", None)
            .iter()
            .map(|s| s.session_id().to_string())
            .collect();
        bearer.sort();
        assert_eq!(bearer, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_appends_still_land() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        session.end();
        let ended_at = session.ended_at().unwrap();
        session.end();
        assert_eq!(session.ended_at(), Some(ended_at));

        session.append_output(Bytes::from_static(b"late flush"));
        assert!(!session.is_active());
        assert_eq!(session.history_bytes(), 10);
    }

    #[tokio::test]
    async fn test_end_broadcasts_once() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let mut events = session.join().events;
        session.end();
        session.end();
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Ended)));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_join_delivers_history_then_live_without_gap() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        session.append_output(Bytes::from_static(b"before"));

        let mut join = session.join();
        session.append_output(Bytes::from_static(b"after"));

        assert_eq!(join.history, vec![Bytes::from_static(b"before")]);
        match join.events.try_recv() {
            Ok(SessionEvent::Output(chunk)) => assert_eq!(&chunk[..], b"after"),
            other => panic!("expected live output, got {other:?}"),
        }
        assert!(matches!(join.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_history_bound_holds_through_session() {
        let mgr = SessionManager::new(64, 900);
        let session = mgr.create("owner", "s1", "hash");
        for _ in 0..100 {
            session.append_output(Bytes::from(vec![b'x'; 16]));
            assert!(session.history_bytes() <= 64);
        }
    }

    #[tokio::test]
    async fn test_forward_input_reaches_upstream_as_frame() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);

        session.forward_input("ls\n");
        let sent = rx.try_recv().unwrap();
        let (ty, payload) = decode_one(&sent);
        assert_eq!(ty, FRAME_TYPE_INPUT);
        assert_eq!(&payload[..], b"ls\n");
    }

    #[tokio::test]
    async fn test_forward_input_without_upstream_is_silent() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        session.forward_input("ls\n"); // must not panic or error
    }

    #[tokio::test]
    async fn test_request_resize_noop_when_unchanged() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);
        let mut events = session.join().events;

        session.request_resize(Some(DEFAULT_COLS), Some(DEFAULT_ROWS));
        assert!(rx.try_recv().is_err(), "no frame for an unchanged size");
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_request_resize_sends_frame_and_updates_size() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);
        let mut events = session.join().events;

        session.request_resize(Some(120), Some(30));
        let (ty, payload) = decode_one(&rx.try_recv().unwrap());
        assert_eq!(ty, FRAME_TYPE_RESIZE);
        assert_eq!(crate::frame::decode_resize(&payload), Some((30, 120)));

        assert!(matches!(events.try_recv(), Ok(SessionEvent::Resize { cols: 120, rows: 30 })));
        let descriptor = session.descriptor();
        assert_eq!((descriptor.cols, descriptor.rows), (120, 30));
    }

    #[tokio::test]
    async fn test_request_resize_missing_dimension_keeps_current() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);

        session.request_resize(Some(100), None);
        let (_, payload) = decode_one(&rx.try_recv().unwrap());
        assert_eq!(crate::frame::decode_resize(&payload), Some((DEFAULT_ROWS, 100)));
    }

    #[tokio::test]
    async fn test_resize_rejects_zero_dimensions() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_upstream(tx);

        session.request_resize(Some(0), Some(30));
        session.update_size(0, 30);
        session.update_size(120, 0);
        assert!(rx.try_recv().is_err());
        let descriptor = session.descriptor();
        assert_eq!((descriptor.cols, descriptor.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[tokio::test]
    async fn test_update_size_broadcasts_only_on_change() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let mut events = session.join().events;

        session.update_size(120, 30);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Resize { cols: 120, rows: 30 })));
        session.update_size(120, 30);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_reap_drops_only_expired_inactive_sessions() {
        let mgr = manager();
        let active = mgr.create("owner", "active", "hash");
        let ended = mgr.create("owner", "ended", "hash");
        ended.end();
        let ended_at = ended.ended_at().unwrap();
        assert!(active.is_active());

        // Exactly at the retention boundary nothing is removed (strictly >).
        assert_eq!(mgr.reap_inactive_at(ended_at + 900), 0);
        assert_eq!(mgr.len(), 2);

        assert_eq!(mgr.reap_inactive_at(ended_at + 901), 1);
        assert_eq!(mgr.len(), 1);
        assert!(mgr.get("owner", "active", None).is_some());
        assert!(mgr.get("owner", "ended", None).is_none());
    }

    #[tokio::test]
    async fn test_reap_never_touches_active_sessions() {
        let mgr = manager();
        mgr.create("owner", "s1", "hash");
        assert_eq!(mgr.reap_inactive_at(u64::MAX), 0);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_descriptor_reflects_lifecycle() {
        let mgr = manager();
        let session = mgr.create("owner", "s1", "hash");
        let descriptor = session.descriptor();
        assert!(descriptor.active);
        assert_eq!(descriptor.id, "s1");
        assert_eq!(descriptor.ended_at, None);

        session.end();
        let descriptor = session.descriptor();
        assert!(!descriptor.active);
        assert!(descriptor.ended_at.is_some());
    }
}
