//! Opaque identifiers used throughout the runtime.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies a server within the cluster.
///
/// Equality is all that the protocol requires; `Ord` is derived purely so that
/// members can be placed in sorted containers during tests and metrics
/// rendering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Identifies a client process across reconnects and re-registrations.
///
/// Generated once per client process; carried on every `RegisterRequest` so a
/// restarted client can eventually be told apart from a live one by an
/// application-level service, though the runtime itself treats two
/// registrations from the same `ClientId` as unrelated sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl ClientId {
    /// Generate a fresh, process-unique client id.
    pub fn generate() -> Self {
        Self(rand::random::<u64>())
    }
}

/// Identifies a session. Assigned as the log index of the `OpenSession` entry
/// which created it, which guarantees cluster-wide uniqueness without any
/// extra coordination beyond the log itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

/// Distinguishes a mutating operation from a read-only one.
///
/// Only `Command` ever traverses the replicated log; `Query` is served
/// out-of-band against the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Command,
    Query,
}

/// `(name, kind)` identifies an operation type registered against a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub name: String,
    pub kind: OperationKind,
}

impl OperationId {
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Command,
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Query,
        }
    }
}
