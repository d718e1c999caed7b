//! Log entry payloads and the operations carried by `Command`/`Query`.

use serde::Deserialize;
use serde::Serialize;

use crate::error::OperationError;
use crate::ids::ClientId;
use crate::ids::OperationId;
use crate::ids::SessionId;

/// An operation submitted against a service: either a mutating `Command`
/// (which travels the replicated log) or a read-only `Query` (served
/// out-of-band against current state).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub payload: Vec<u8>,
}

/// The result of applying or querying an [`Operation`].
///
/// `event_index` is the index of the last event the caller should observe
/// before this result was produced — a client dispatcher should not deliver
/// this result to its caller until its local `version >= event_index`.
/// `outcome` carries a structured [`OperationError`] rather than a bare
/// string so callers (the Retry Classifier in particular) can match on the
/// error kind instead of parsing text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub index: u64,
    pub event_index: u64,
    pub outcome: Result<Vec<u8>, OperationError>,
}

impl OperationResult {
    pub fn ok(index: u64, event_index: u64, value: Vec<u8>) -> Self {
        Self {
            index,
            event_index,
            outcome: Ok(value),
        }
    }

    pub fn err(index: u64, event_index: u64, error: OperationError) -> Self {
        Self {
            index,
            event_index,
            outcome: Err(error),
        }
    }
}

/// The committed log entry payload variants. `Query` never travels the log —
/// it is dispatched out-of-band — so it has no variant here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Forces prior-term entries to commit and supplies a monotonic time
    /// pulse during leadership churn.
    Initialize,
    /// Same handling as `Initialize`: a configuration-change marker from the
    /// consensus layer with no service-level effect beyond the time pulse.
    Configuration,
    OpenSession {
        service_name: String,
        service_type: String,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
        client_id: ClientId,
    },
    KeepAlive {
        session_ids: Vec<SessionId>,
        command_seqs: Vec<u64>,
        event_indexes: Vec<u64>,
    },
    CloseSession {
        session_id: SessionId,
    },
    Command {
        session_id: SessionId,
        sequence: u64,
        op: Operation,
    },
    Metadata {
        session_id: Option<SessionId>,
    },
}

/// How a `Query` may be served: whether reads require a leader lease
/// re-confirmation or may be answered by any replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    Sequential,
    LinearizableLease,
    Linearizable,
}

/// A log entry as delivered by the external consensus log: every entry
/// carries `(index, term, timestamp)`, with timestamps leader-assigned and
/// monotonic across committed entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub timestamp: u64,
    pub payload: EntryPayload,
}
