//! The wire contract between a [`super::DispatcherHandle`] and a cluster
//! member, and the trait an RPC layer must implement to carry it.
//!
//! This crate does not ship a transport: implementations are expected to
//! carry these requests over whatever the deployment uses (gRPC, an HTTP
//! API, an in-process channel for tests), the same way the committed log
//! itself is supplied externally via [`crate::log_cursor::CommittedLog`].

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::cluster::ClusterView;
use crate::entry::Operation;
use crate::entry::OperationResult;
use crate::entry::ReadConsistency;
use crate::error::RsmError;
use crate::ids::ClientId;
use crate::ids::MemberId;
use crate::ids::SessionId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub cluster_name: String,
    pub client_id: ClientId,
    pub service_name: String,
    pub service_type: String,
    pub read_consistency: ReadConsistency,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session_id: SessionId,
    pub sequence: u64,
    /// The client's last-observed session event index, carried for the same
    /// freshness bookkeeping a `QueryRequest` uses.
    pub version: u64,
    pub op: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session_id: SessionId,
    pub service_name: String,
    /// The client's last-observed session event index. Combined with the
    /// session's `ReadConsistency`, this tells the serving replica how fresh
    /// its state must be before answering: `Sequential` only needs to catch
    /// up to `version` (the caller's own writes), while
    /// `LinearizableLease`/`Linearizable` must catch up to everything
    /// currently committed regardless of `version`.
    pub version: u64,
    pub op: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: SessionId,
    pub acknowledged_sequence: u64,
    pub acknowledged_event_index: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: SessionId,
}

/// The RPC surface a Client Dispatcher needs against one cluster member.
///
/// Every method takes the member to address explicitly; the dispatcher owns
/// leader tracking and retry policy, this trait only carries bytes.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    async fn register(&self, target: MemberId, req: RegisterRequest) -> Result<RegisterResponse, RsmError>;

    async fn submit_command(&self, target: MemberId, req: CommandRequest) -> Result<OperationResult, RsmError>;

    async fn submit_query(&self, target: MemberId, req: QueryRequest) -> Result<Vec<u8>, RsmError>;

    async fn keep_alive(&self, target: MemberId, req: KeepAliveRequest) -> Result<(), RsmError>;

    async fn close_session(&self, target: MemberId, req: CloseSessionRequest) -> Result<(), RsmError>;

    /// Fetch `target`'s current view of cluster membership and leadership,
    /// used to discover a leader when none is known or the sticky guess
    /// turned out to be stale.
    async fn current_view(&self, target: MemberId) -> Result<ClusterView, RsmError>;
}
