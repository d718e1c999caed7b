//! A single-process test harness standing in for a real consensus layer.
//!
//! There is exactly one committed log and one Apply Engine "leader" here —
//! this crate does not implement replication, so the harness cannot model
//! multiple raft members disagreeing. It exists to drive the Apply Engine
//! and Client Dispatcher against each other without a real network or
//! consensus layer underneath.

#![allow(dead_code)]

use std::convert::TryInto;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use replikit::client::CloseSessionRequest;
use replikit::client::CommandRequest;
use replikit::client::KeepAliveRequest;
use replikit::client::QueryRequest;
use replikit::client::RegisterRequest;
use replikit::client::RegisterResponse;
use replikit::cluster::ClusterView;
use replikit::cluster::Member;
use replikit::cluster::Role;
use replikit::entry::EntryPayload;
use replikit::entry::LogEntry;
use replikit::error::RsmError;
use replikit::ids::MemberId;
use replikit::ids::SessionId;
use replikit::ApplyEngineHandle;
use replikit::ClusterTransport;
use replikit::CommittedLog;
use replikit::ServiceFactory;
use tokio::sync::Mutex;

/// An in-memory, append-only committed log. Entries below `base_offset` have
/// been truncated away by compaction.
pub struct InMemoryLog {
    entries: Mutex<Vec<LogEntry>>,
    base_offset: AtomicU64,
    next_index: AtomicU64,
    next_ts: AtomicU64,
}

impl InMemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            base_offset: AtomicU64::new(0),
            next_index: AtomicU64::new(1),
            next_ts: AtomicU64::new(1),
        })
    }

    /// Append `payload` as a new committed entry and return its index.
    pub async fn append(&self, payload: EntryPayload) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let entry = LogEntry {
            index,
            term: 1,
            timestamp: ts,
            payload,
        };
        self.entries.lock().await.push(entry);
        index
    }
}

#[async_trait]
impl CommittedLog for InMemoryLog {
    async fn read(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        let entries = self.entries.lock().await;
        let base = self.base_offset.load(Ordering::SeqCst);
        if index <= base {
            return Ok(None);
        }
        Ok(entries.iter().find(|e| e.index == index).cloned())
    }

    async fn last_committed_index(&self) -> anyhow::Result<u64> {
        Ok(self.next_index.load(Ordering::SeqCst) - 1)
    }

    async fn is_compactable(&self, _index: u64) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn truncate_through(&self, index: u64) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.index > index);
        self.base_offset.store(index, Ordering::SeqCst);
        Ok(())
    }
}

/// A single simulated cluster member: one shared log, one Apply Engine.
pub struct Node {
    pub id: MemberId,
    pub log: Arc<InMemoryLog>,
    pub engine: Arc<ApplyEngineHandle>,
}

impl Node {
    pub fn new(id: MemberId, factory: Arc<dyn ServiceFactory>) -> Self {
        let log = InMemoryLog::new();
        let engine = Arc::new(ApplyEngineHandle::new(log.clone(), factory));
        Self { id, log, engine }
    }

    async fn append_and_apply(&self, payload: EntryPayload) -> Result<replikit::OperationResult, RsmError> {
        let index = self.log.append(payload).await;
        self.engine
            .apply(index)
            .await?
            .ok_or(RsmError::Transport("entry vanished before apply".into()))
    }
}

/// A [`ClusterTransport`] addressing a single in-process [`Node`], acting as
/// the sole member and permanent leader — sufficient to exercise dispatcher
/// behavior without a real consensus layer.
pub struct SingleNodeTransport {
    pub node: Arc<Node>,
}

impl SingleNodeTransport {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ClusterTransport for SingleNodeTransport {
    async fn register(&self, _target: MemberId, req: RegisterRequest) -> Result<RegisterResponse, RsmError> {
        let result = self
            .node
            .append_and_apply(EntryPayload::OpenSession {
                service_name: req.service_name,
                service_type: req.service_type,
                read_consistency: req.read_consistency,
                timeout_ms: req.timeout_ms,
                client_id: req.client_id,
            })
            .await?;
        let bytes = result.outcome.map_err(RsmError::from)?;
        let id = u64::from_be_bytes(bytes.try_into().map_err(|_| RsmError::ProtocolError("bad session id".into()))?);
        Ok(RegisterResponse {
            session_id: SessionId(id),
        })
    }

    async fn submit_command(&self, _target: MemberId, req: CommandRequest) -> Result<replikit::OperationResult, RsmError> {
        self.node
            .append_and_apply(EntryPayload::Command {
                session_id: req.session_id,
                sequence: req.sequence,
                op: req.op,
            })
            .await
    }

    async fn submit_query(&self, _target: MemberId, req: QueryRequest) -> Result<Vec<u8>, RsmError> {
        self.node.engine.query(req.session_id, req.service_name, req.version, req.op).await
    }

    async fn keep_alive(&self, _target: MemberId, req: KeepAliveRequest) -> Result<(), RsmError> {
        self.node
            .append_and_apply(EntryPayload::KeepAlive {
                session_ids: vec![req.session_id],
                command_seqs: vec![req.acknowledged_sequence],
                event_indexes: vec![req.acknowledged_event_index],
            })
            .await?;
        Ok(())
    }

    async fn close_session(&self, _target: MemberId, req: CloseSessionRequest) -> Result<(), RsmError> {
        self.node
            .append_and_apply(EntryPayload::CloseSession {
                session_id: req.session_id,
            })
            .await?;
        Ok(())
    }

    async fn current_view(&self, _target: MemberId) -> Result<ClusterView, RsmError> {
        let member = Member::new(self.node.id, "localhost", 0, Role::Active);
        ClusterView::new(vec![member], Some(self.node.id), 1).map_err(|e| RsmError::ProtocolError(e.to_string()))
    }
}
