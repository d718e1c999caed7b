//! The Apply Engine: consumes committed entries in strict index order and
//! dispatches them to sessions and services.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::entry::EntryPayload;
use crate::entry::LogEntry;
use crate::entry::Operation;
use crate::entry::OperationResult;
use crate::entry::ReadConsistency;
use crate::error::OperationError;
use crate::error::RsmError;
use crate::ids::SessionId;
use crate::log_cursor::CommittedLog;
use crate::metrics::ApplyMetrics;
use crate::service::Event;
use crate::service::EventTarget;
use crate::service::ServiceFactory;
use crate::service::ServiceRegistry;
use crate::service::SessionMetadata;
use crate::session::SessionState;
use crate::session::SessionStatus;
use crate::session::SessionTable;

/// Fire-and-forget / reply-bearing API offered to the consensus layer and to
/// the Compactor.
pub struct ApplyEngineHandle {
    tx_api: mpsc::UnboundedSender<ApplyMsg>,
    rx_metrics: watch::Receiver<ApplyMetrics>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ApplyEngineHandle {
    pub fn new(log: Arc<dyn CommittedLog>, factory: Arc<dyn ServiceFactory>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ApplyMetrics::default());
        let join = ApplyEngineCore::spawn(log, factory, rx_api, tx_metrics);
        Self {
            tx_api,
            rx_metrics,
            join: Mutex::new(Some(join)),
        }
    }

    /// Start an Apply Engine that first restores every service named in
    /// `snapshots` and re-hydrates the sessions bundled with them, then
    /// resumes ordinary log application from beyond the highest restored
    /// index. This is how a newly joined replica catches up from a snapshot
    /// plus the log tail instead of replaying the whole history.
    pub async fn new_from_snapshots(
        log: Arc<dyn CommittedLog>,
        factory: Arc<dyn ServiceFactory>,
        snapshots: Vec<ServiceSnapshot>,
    ) -> anyhow::Result<Self> {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ApplyMetrics::default());
        let join = ApplyEngineCore::spawn_from_snapshots(log, factory, snapshots, rx_api, tx_metrics).await?;
        Ok(Self {
            tx_api,
            rx_metrics,
            join: Mutex::new(Some(join)),
        })
    }

    /// Apply every committed entry up to `index`, discarding results.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_all(&self, index: u64) {
        let _ = self.tx_api.send(ApplyMsg::ApplyAll { index });
    }

    /// Apply up to and including `index`, resolving with that entry's result.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn apply(&self, index: u64) -> Result<Option<OperationResult>, RsmError> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(ApplyMsg::Apply { index, reply: tx })
            .map_err(|_| RsmError::Transport("apply engine is gone".into()))?;
        rx.await.map_err(|_| RsmError::Transport("apply engine dropped reply".into()))?
    }

    /// Serve a `Query` out-of-band against the service's current state.
    /// `client_version` is the caller's last-observed session event index;
    /// combined with the session's `ReadConsistency` this decides how fresh
    /// the serving replica's state must be before the query runs.
    #[tracing::instrument(level = "debug", skip(self, op))]
    pub async fn query(&self, session_id: SessionId, service_name: String, client_version: u64, op: Operation) -> Result<Vec<u8>, RsmError> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(ApplyMsg::Query {
                session_id,
                service_name,
                client_version,
                op,
                reply: tx,
            })
            .map_err(|_| RsmError::Transport("apply engine is gone".into()))?;
        rx.await.map_err(|_| RsmError::Transport("apply engine dropped reply".into()))?
    }

    /// Scoped-to-one-service or cluster-wide session metadata.
    pub async fn metadata(&self, session_id: Option<SessionId>) -> Vec<SessionMetadata> {
        let (tx, rx) = oneshot::channel();
        if self.tx_api.send(ApplyMsg::Metadata { session_id, reply: tx }).is_ok() {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// A copy of every retained per-service snapshot, for a new replica to
    /// bootstrap from via [`ApplyEngineHandle::new_from_snapshots`].
    pub async fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.tx_api.send(ApplyMsg::Snapshots { reply: tx }).is_ok() {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    pub fn metrics(&self) -> watch::Receiver<ApplyMetrics> {
        self.rx_metrics.clone()
    }

    /// Request one compaction cycle. Requests are serialized by the same
    /// single-threaded core that applies entries, so overlapping calls
    /// simply queue rather than racing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn compact(&self) -> anyhow::Result<CompactionReport> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(ApplyMsg::Compact { reply: tx })
            .map_err(|_| anyhow::anyhow!("apply engine is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("apply engine dropped reply"))?
    }

    pub async fn shutdown(&self) {
        drop(self.tx_api.clone());
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
    }
}

enum ApplyMsg {
    ApplyAll {
        index: u64,
    },
    Apply {
        index: u64,
        reply: oneshot::Sender<Result<Option<OperationResult>, RsmError>>,
    },
    Query {
        session_id: SessionId,
        service_name: String,
        client_version: u64,
        op: Operation,
        reply: oneshot::Sender<Result<Vec<u8>, RsmError>>,
    },
    Metadata {
        session_id: Option<SessionId>,
        reply: oneshot::Sender<Vec<SessionMetadata>>,
    },
    Compact {
        reply: oneshot::Sender<anyhow::Result<CompactionReport>>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<ServiceSnapshot>>,
    },
}

/// The single-threaded cooperative core driving application of the log.
pub(crate) struct ApplyEngineCore {
    log: Arc<dyn CommittedLog>,
    registry: ServiceRegistry,
    sessions: SessionTable,
    /// The index of the entry to read and apply next.
    next_index: u64,
    /// The index of the highest entry applied so far; 0 means nothing has
    /// been applied yet.
    last_applied: u64,
    /// The timestamp carried by the most recently applied entry; used to
    /// serve `Query`s against "now" without any wall-clock dependence.
    last_ts: u64,
    /// The most recent snapshot retained per service, kept around after a
    /// service is destroyed so a later `OpenSession` for the same name (or a
    /// replica bootstrapping via `spawn_from_snapshots`) can restore instead
    /// of starting blank.
    last_snapshots: IndexMap<String, ServiceSnapshot>,
    tx_metrics: watch::Sender<ApplyMetrics>,
    rx_api: mpsc::UnboundedReceiver<ApplyMsg>,
}

impl ApplyEngineCore {
    fn spawn(
        log: Arc<dyn CommittedLog>,
        factory: Arc<dyn ServiceFactory>,
        rx_api: mpsc::UnboundedReceiver<ApplyMsg>,
        tx_metrics: watch::Sender<ApplyMetrics>,
    ) -> JoinHandle<()> {
        let this = Self {
            log,
            registry: ServiceRegistry::new(factory),
            sessions: SessionTable::new(),
            next_index: 1,
            last_applied: 0,
            last_ts: 0,
            last_snapshots: IndexMap::new(),
            tx_metrics,
            rx_api,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("apply-engine")))
    }

    /// Rehydrate a `ServiceContext` plus its sessions from each snapshot
    /// before resuming application from beyond the highest restored index.
    async fn spawn_from_snapshots(
        log: Arc<dyn CommittedLog>,
        factory: Arc<dyn ServiceFactory>,
        snapshots: Vec<ServiceSnapshot>,
        rx_api: mpsc::UnboundedReceiver<ApplyMsg>,
        tx_metrics: watch::Sender<ApplyMetrics>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let mut registry = ServiceRegistry::new(factory);
        let mut sessions = SessionTable::new();
        let mut last_snapshots = IndexMap::new();
        let mut highest_index = 0;

        for snapshot in snapshots {
            highest_index = highest_index.max(snapshot.index);
            let ctx = registry
                .ensure(&snapshot.service_name, &snapshot.service_type, snapshot.index)
                .ok_or_else(|| anyhow::anyhow!("service factory does not recognize type {:?}", snapshot.service_type))?;
            ctx.restore(snapshot.index, snapshot.bytes.clone()).await?;
            for session in &snapshot.sessions {
                sessions.insert(session.clone());
            }
            last_snapshots.insert(snapshot.service_name.clone(), snapshot);
        }

        let this = Self {
            log,
            registry,
            sessions,
            next_index: highest_index + 1,
            last_applied: highest_index,
            last_ts: 0,
            last_snapshots,
            tx_metrics,
            rx_api,
        };
        Ok(tokio::spawn(this.main().instrument(tracing::debug_span!("apply-engine"))))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn main(mut self) {
        while let Some(msg) = self.rx_api.recv().await {
            match msg {
                ApplyMsg::ApplyAll { index } => {
                    if let Err(err) = self.advance_to(index).await {
                        tracing::error!(error = %err, "fatal apply error, halting");
                        return;
                    }
                }
                ApplyMsg::Apply { index, reply } => {
                    let res = self.advance_to(index).await;
                    let fatal = res.as_ref().err().map(|e| e.is_fatal()).unwrap_or(false);
                    let _ = reply.send(res);
                    if fatal {
                        tracing::error!("fatal apply error, halting applier");
                        return;
                    }
                }
                ApplyMsg::Query {
                    session_id,
                    service_name,
                    client_version,
                    op,
                    reply,
                } => {
                    let res = self.query(session_id, &service_name, client_version, op).await;
                    let _ = reply.send(res);
                }
                ApplyMsg::Metadata { session_id, reply } => {
                    let _ = reply.send(self.metadata_snapshot(session_id));
                }
                ApplyMsg::Compact { reply } => {
                    let res = self.compact_once().await;
                    let _ = reply.send(res);
                }
                ApplyMsg::Snapshots { reply } => {
                    let _ = reply.send(self.last_snapshots.values().cloned().collect());
                }
            }
            self.report_metrics();
        }
    }

    fn report_metrics(&self) {
        let _ = self.tx_metrics.send(ApplyMetrics {
            last_applied: self.last_applied,
            session_count: self.sessions.len(),
            service_count: self.registry.len(),
            last_compacted: self.registry.iter().map(|(_, c)| c.last_compacted_index).min().unwrap_or(0),
        });
    }

    /// Drive application forward until `target` is reached or the log has
    /// nothing further committed yet.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn advance_to(&mut self, target: u64) -> Result<Option<OperationResult>, RsmError> {
        let mut result = None;
        loop {
            if self.next_index > self.last_applied + 1 && self.last_applied != 0 {
                return Err(RsmError::NonSequential {
                    expected: self.last_applied + 1,
                    got: self.next_index,
                });
            }
            if self.next_index < self.last_applied {
                return Err(RsmError::DuplicateApply(self.next_index));
            }
            if self.next_index > target {
                break;
            }
            let entry = match self.log.read(self.next_index).await.map_err(|e| RsmError::Transport(e.to_string()))? {
                Some(entry) => entry,
                None => break,
            };
            let applied_index = entry.index;
            let applied_result = self.apply_entry(entry).await;
            self.last_applied = applied_index;
            if applied_index == target {
                result = applied_result;
                self.next_index = applied_index + 1;
                break;
            }
            self.next_index = applied_index + 1;
        }
        Ok(result)
    }

    #[tracing::instrument(level = "trace", skip(self, entry), fields(index = entry.index))]
    async fn apply_entry(&mut self, entry: LogEntry) -> Option<OperationResult> {
        let index = entry.index;
        let ts = entry.timestamp;
        self.last_ts = ts;
        match entry.payload {
            EntryPayload::Initialize | EntryPayload::Configuration => {
                self.keep_alive_sessions_pulse(index, ts);
                None
            }
            EntryPayload::OpenSession {
                service_name,
                service_type,
                read_consistency,
                timeout_ms,
                client_id,
            } => Some(self.apply_open_session(index, ts, service_name, service_type, read_consistency, timeout_ms, client_id).await),
            EntryPayload::KeepAlive {
                session_ids,
                command_seqs,
                event_indexes,
            } => Some(self.apply_keep_alive(index, ts, session_ids, command_seqs, event_indexes).await),
            EntryPayload::CloseSession { session_id } => Some(self.apply_close_session(index, ts, session_id).await),
            EntryPayload::Command { session_id, sequence, op } => {
                Some(self.apply_command(index, ts, session_id, sequence, op).await)
            }
            EntryPayload::Metadata { session_id } => {
                let snapshot = self.metadata_snapshot(session_id);
                let bytes = serde_json::to_vec(&snapshot).unwrap_or_default();
                Some(OperationResult::ok(index, index, bytes))
            }
        }
    }

    /// `Initialize`/`Configuration`: force a monotonic time pulse across
    /// every open session without deciding expiry.
    fn keep_alive_sessions_pulse(&mut self, _index: u64, ts: u64) {
        for (_, session) in self.sessions.iter_mut() {
            if session.is_open() {
                session.last_heartbeat_ts = ts;
            }
        }
    }

    async fn apply_open_session(
        &mut self,
        index: u64,
        ts: u64,
        service_name: String,
        service_type: String,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
        client_id: crate::ids::ClientId,
    ) -> OperationResult {
        let session_id = SessionId(index);
        let is_new_service = self.registry.get(&service_name).is_none();
        let ctx = match self.registry.ensure(&service_name, &service_type, index) {
            Some(ctx) => ctx,
            None => {
                return OperationResult::err(index, index, OperationError::UnknownService(service_type));
            }
        };

        // A service created fresh but previously destroyed (compacted away
        // with no remaining sessions) restores from its retained snapshot
        // instead of starting blank, re-hydrating the sessions it had open.
        if is_new_service {
            if let Some(snapshot) = self.last_snapshots.remove(&service_name) {
                match ctx.restore(snapshot.index, snapshot.bytes).await {
                    Ok(()) => {
                        for session in snapshot.sessions {
                            self.sessions.insert(session);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(service = %service_name, error = %err, "failed to restore retained snapshot, starting fresh");
                    }
                }
            }
        }

        match ctx.open_session(index, ts, session_id).await {
            Ok(()) => {
                self.sessions.insert(SessionState::new(
                    session_id,
                    client_id,
                    service_name,
                    service_type,
                    read_consistency,
                    timeout_ms,
                    ts,
                ));
                OperationResult::ok(index, index, session_id.0.to_be_bytes().to_vec())
            }
            Err(err) => OperationResult::err(index, index, OperationError::ApplicationError(err.to_string())),
        }
    }

    async fn apply_keep_alive(
        &mut self,
        index: u64,
        ts: u64,
        session_ids: Vec<SessionId>,
        command_seqs: Vec<u64>,
        event_indexes: Vec<u64>,
    ) -> OperationResult {
        let mut live = Vec::with_capacity(session_ids.len());
        for (i, sid) in session_ids.into_iter().enumerate() {
            if let Some(session) = self.sessions.get_mut(sid) {
                if session.is_open() {
                    session.last_heartbeat_ts = ts;
                    session.trim(command_seqs[i], event_indexes[i]);
                    live.push(sid);
                }
            }
        }

        self.complete_keep_alive(index, ts).await;

        OperationResult::ok(index, index, serde_json::to_vec(&live.iter().map(|s| s.0).collect::<Vec<_>>()).unwrap_or_default())
    }

    /// Expire any session whose heartbeat has stalled past its timeout,
    /// across every service.
    async fn complete_keep_alive(&mut self, index: u64, ts: u64) {
        let stale: Vec<(String, SessionId)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_open() && s.is_stale(ts))
            .map(|(id, s)| (s.service_name.clone(), *id))
            .collect();

        for (service_name, session_id) in stale {
            let events = if let Some(ctx) = self.registry.get_mut(&service_name) {
                ctx.expire_session(index, ts, session_id).await
            } else {
                Vec::new()
            };
            self.deliver_events(&service_name, session_id, index, events);
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.status = SessionStatus::Expired;
            }
        }
    }

    async fn apply_close_session(&mut self, index: u64, ts: u64, session_id: SessionId) -> OperationResult {
        let service_name = match self.sessions.get(session_id) {
            Some(s) => s.service_name.clone(),
            None => {
                return OperationResult::err(index, index, OperationError::UnknownSession(session_id));
            }
        };
        if let Some(ctx) = self.registry.get_mut(&service_name) {
            ctx.close_session(index, ts, session_id).await;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.status = SessionStatus::Closed;
        }
        OperationResult::ok(index, index, Vec::new())
    }

    async fn apply_command(
        &mut self,
        index: u64,
        ts: u64,
        session_id: SessionId,
        sequence: u64,
        op: Operation,
    ) -> OperationResult {
        let service_name = match self.sessions.get(session_id) {
            Some(s) if s.is_open() => s.service_name.clone(),
            _ => {
                return OperationResult::err(index, index, OperationError::UnknownSession(session_id));
            }
        };

        // Idempotent replay / sequencing check, enforced here rather than
        // inside the service implementation: exactly-once is a property of
        // the Apply Engine's session cache, not of user code.
        {
            let session = self.sessions.get(session_id).expect("checked above");
            if sequence <= session.command_sequence {
                if let Some(cached) = session.pending_commands.get(&sequence) {
                    return cached.clone();
                }
                return OperationResult::err(
                    index,
                    session.event_index,
                    OperationError::ApplicationError(format!("command sequence {} already acknowledged and no longer cached", sequence)),
                );
            }
            if sequence != session.command_sequence + 1 {
                return OperationResult::err(
                    index,
                    session.event_index,
                    OperationError::ApplicationError(format!(
                        "out-of-order command sequence: expected {}, got {}",
                        session.command_sequence + 1,
                        sequence
                    )),
                );
            }
        }

        let ctx = match self.registry.get_mut(&service_name) {
            Some(ctx) => ctx,
            None => {
                return OperationResult::err(index, index, OperationError::UnknownService(service_name));
            }
        };

        let outcome = ctx.command(index, ts, session_id, op).await;
        let result = match outcome.result {
            Ok(value) => {
                self.deliver_events(&service_name, session_id, index, outcome.events);
                OperationResult::ok(index, index, value)
            }
            Err(msg) => OperationResult::err(index, index, OperationError::ApplicationError(msg)),
        };

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.pending_commands.insert(sequence, result.clone());
            session.command_sequence = sequence;
            if result.outcome.is_ok() {
                session.event_index = index;
            }
        }

        result
    }

    fn deliver_events(&mut self, service_name: &str, owner: SessionId, index: u64, events: Vec<Event>) {
        for event in events {
            match event.target {
                EventTarget::Owner => {
                    if let Some(session) = self.sessions.get_mut(owner) {
                        session.pending_events.insert(index, event.payload);
                    }
                }
                EventTarget::Broadcast => {
                    let recipients: Vec<SessionId> = self
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.service_name == service_name && s.is_open())
                        .map(|(id, _)| *id)
                        .collect();
                    for id in recipients {
                        if let Some(session) = self.sessions.get_mut(id) {
                            session.pending_events.insert(index, event.payload.clone());
                        }
                    }
                }
            }
        }
    }

    /// Serve a `Query` against current state without mutation.
    ///
    /// How fresh the serving state must be depends on the session's
    /// `ReadConsistency`: `Sequential` only needs to reflect `client_version`
    /// (the caller's own prior writes), while `LinearizableLease` and
    /// `Linearizable` must reflect everything currently committed to the log
    /// before the query runs.
    async fn query(&mut self, session_id: SessionId, service_name: &str, client_version: u64, op: Operation) -> Result<Vec<u8>, RsmError> {
        let read_consistency = match self.sessions.get(session_id) {
            Some(s) if s.is_open() => s.read_consistency,
            _ => return Err(RsmError::UnknownSession(session_id)),
        };

        let required = match read_consistency {
            ReadConsistency::Sequential => client_version,
            ReadConsistency::LinearizableLease | ReadConsistency::Linearizable => {
                self.log.last_committed_index().await.map_err(|e| RsmError::Transport(e.to_string()))?
            }
        };
        if required > self.last_applied {
            self.advance_to(required).await?;
        }

        let ctx = self
            .registry
            .get(service_name)
            .ok_or_else(|| RsmError::UnknownService(service_name.to_string()))?;
        ctx.query(self.last_ts, op).await.map_err(RsmError::ApplicationError)
    }

    fn metadata_snapshot(&self, session_id: Option<SessionId>) -> Vec<SessionMetadata> {
        match session_id {
            Some(id) => match self.sessions.get(id) {
                Some(session) => self
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.service_name == session.service_name)
                    .map(|(_, s)| SessionMetadata {
                        id: s.id,
                        service_name: s.service_name.clone(),
                        service_type: s.service_type.clone(),
                    })
                    .collect(),
                None => Vec::new(),
            },
            None => self
                .sessions
                .iter()
                .map(|(_, s)| SessionMetadata {
                    id: s.id,
                    service_name: s.service_name.clone(),
                    service_type: s.service_type.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub(crate) fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// One compaction cycle: snapshot every service at the highest index
    /// every replica's log considers safe to compact beneath, then truncate
    /// the log. Runs on the same single-threaded loop as `apply`, so it
    /// never races entry application. A service left with no sessions
    /// referencing it after truncation is destroyed; its snapshot stays
    /// cached so a later `OpenSession` for the same name restores it rather
    /// than starting over.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn compact_once(&mut self) -> anyhow::Result<CompactionReport> {
        let last_committed = self.log.last_committed_index().await?;
        if last_committed == 0 {
            return Ok(CompactionReport::default());
        }

        let candidate = self
            .registry
            .iter()
            .map(|(_, ctx)| ctx.last_applied_index)
            .min()
            .unwrap_or(0)
            .min(last_committed);

        if candidate == 0 || !self.log.is_compactable(candidate).await? {
            return Ok(CompactionReport::default());
        }

        let mut snapshotted = 0;
        let names: Vec<String> = self.registry.iter().map(|(name, _)| name.clone()).collect();
        for name in &names {
            if let Some(ctx) = self.registry.get_mut(name) {
                if ctx.last_compacted_index >= candidate {
                    continue;
                }
                match ctx.take_snapshot(candidate).await {
                    Ok(bytes) => {
                        ctx.complete_snapshot(candidate);
                        let service_type = ctx.service_type.clone();
                        let sessions: Vec<SessionState> =
                            self.sessions.iter().filter(|(_, s)| s.service_name == *name).map(|(_, s)| s.clone()).collect();
                        self.last_snapshots.insert(
                            name.clone(),
                            ServiceSnapshot {
                                service_name: name.clone(),
                                service_type,
                                index: candidate,
                                bytes,
                                sessions,
                            },
                        );
                        snapshotted += 1;
                    }
                    Err(err) => {
                        tracing::warn!(service = %name, error = %err, "snapshot failed, skipping truncation this cycle");
                        return Ok(CompactionReport {
                            truncated_through: None,
                            services_snapshotted: snapshotted,
                        });
                    }
                }
            }
        }

        self.sessions.retain_open_or_uncompacted(candidate);
        self.log.truncate_through(candidate).await?;

        for name in &names {
            let still_referenced = self.sessions.iter().any(|(_, s)| s.service_name == *name);
            if !still_referenced && self.last_snapshots.contains_key(name) {
                self.registry.remove(name);
            }
        }

        Ok(CompactionReport {
            truncated_through: Some(candidate),
            services_snapshotted: snapshotted,
        })
    }
}

/// What one compaction cycle accomplished, for logging and testing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub truncated_through: Option<u64>,
    pub services_snapshotted: usize,
}

/// A captured, restorable snapshot of one service: its serialized state plus
/// the sessions that referenced it at the time. Retained after the service
/// is destroyed so a later `OpenSession` for the same name restores instead
/// of starting blank, and exposed via [`ApplyEngineHandle::snapshots`] so a
/// new replica can bootstrap with [`ApplyEngineHandle::new_from_snapshots`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub service_type: String,
    pub index: u64,
    pub bytes: Vec<u8>,
    pub sessions: Vec<SessionState>,
}

impl RsmError {
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, RsmError::NonSequential { .. } | RsmError::DuplicateApply(_))
    }
}
