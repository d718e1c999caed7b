//! Server-side session lifecycle.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::entry::OperationResult;
use crate::ids::ClientId;
use crate::ids::SessionId;

/// A session's lifecycle state. Once a session leaves `Open` it never
/// returns — `Expired` and `Closed` are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Open,
    Expired,
    Closed,
}

/// Server-side view of a single client session.
///
/// Invariants: `command_sequence` is monotonically non-decreasing;
/// `event_index <= last_applied_index` of the owning service; once `status`
/// leaves `Open` it never returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub id: SessionId,
    pub client_id: ClientId,
    pub service_name: String,
    pub service_type: String,
    pub read_consistency: crate::entry::ReadConsistency,
    pub timeout_ms: u64,
    pub last_heartbeat_ts: u64,
    pub command_sequence: u64,
    pub event_index: u64,
    /// Cached results keyed by command sequence, retained until a
    /// `KeepAlive` acknowledges the sequence or the session closes.
    pub pending_commands: IndexMap<u64, OperationResult>,
    /// Events generated for this session, in `(eventIndex)` order, retained
    /// until a `KeepAlive` acknowledges the event index.
    pub pending_events: IndexMap<u64, Vec<u8>>,
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        client_id: ClientId,
        service_name: String,
        service_type: String,
        read_consistency: crate::entry::ReadConsistency,
        timeout_ms: u64,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            client_id,
            service_name,
            service_type,
            read_consistency,
            timeout_ms,
            last_heartbeat_ts: created_at,
            command_sequence: 0,
            event_index: 0,
            pending_commands: IndexMap::new(),
            pending_events: IndexMap::new(),
            status: SessionStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Drop cached command results at or below `through_seq` and cached
    /// events at or below `through_event_index`, per a `KeepAlive` ack.
    pub fn trim(&mut self, through_seq: u64, through_event_index: u64) {
        self.pending_commands.retain(|seq, _| *seq > through_seq);
        self.pending_events.retain(|idx, _| *idx > through_event_index);
    }

    /// Whether `ts` has exceeded this session's timeout since the last
    /// observed heartbeat.
    pub fn is_stale(&self, ts: u64) -> bool {
        ts.saturating_sub(self.last_heartbeat_ts) > self.timeout_ms
    }
}

/// `SessionId -> SessionState`, insertion-ordered so Metadata snapshots and
/// broadcast-event fanout observe a stable, deterministic iteration order
/// across replicas.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: IndexMap<SessionId, SessionState>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, session: SessionState) {
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionState> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionState)> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SessionId, &mut SessionState)> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove a session entirely. Called only by compaction, never by
    /// expiry/close: expiry and close flip `status` but leave the entry in
    /// place so late-arriving commands/keep-alives still resolve to a known
    /// session.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionState> {
        self.sessions.shift_remove(&id)
    }

    /// Garbage-collect non-open sessions once their last relevant log index
    /// has been compacted beneath `through_index`. Open sessions are
    /// always kept regardless of `through_index`.
    pub fn retain_open_or_uncompacted(&mut self, through_index: u64) {
        self.sessions.retain(|_, s| s.is_open() || s.event_index > through_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ReadConsistency;

    fn new_session(id: u64) -> SessionState {
        SessionState::new(
            SessionId(id),
            ClientId(1),
            "svc".into(),
            "kv".into(),
            ReadConsistency::Linearizable,
            5_000,
            0,
        )
    }

    #[test]
    fn trim_drops_acknowledged_entries_only() {
        let mut s = new_session(1);
        s.pending_commands.insert(1, OperationResult::ok(10, 10, vec![]));
        s.pending_commands.insert(2, OperationResult::ok(11, 11, vec![]));
        s.pending_events.insert(10, vec![1]);
        s.pending_events.insert(11, vec![2]);

        s.trim(1, 10);

        assert!(!s.pending_commands.contains_key(&1));
        assert!(s.pending_commands.contains_key(&2));
        assert!(!s.pending_events.contains_key(&10));
        assert!(s.pending_events.contains_key(&11));
    }

    #[test]
    fn is_stale_respects_per_session_timeout() {
        let mut s = new_session(1);
        s.last_heartbeat_ts = 1_000;
        s.timeout_ms = 500;
        assert!(!s.is_stale(1_400));
        assert!(s.is_stale(1_600));
    }

    #[test]
    fn table_preserves_insertion_order() {
        let mut table = SessionTable::new();
        table.insert(new_session(3));
        table.insert(new_session(1));
        table.insert(new_session(2));
        let ids: Vec<u64> = table.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }
}
