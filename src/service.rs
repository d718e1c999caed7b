//! Per-service execution: the `Service` trait user code implements, the
//! single-threaded actor that runs it, and the registry that creates and
//! tracks `ServiceContext`s.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::entry::Operation;
use crate::ids::SessionId;

/// Where a generated event should be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventTarget {
    /// Delivered only to the session that produced it.
    Owner,
    /// Delivered to every currently open session of the service.
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub target: EventTarget,
    pub payload: Vec<u8>,
}

/// The outcome of executing a `Command` against a service implementation.
pub struct CommandOutcome {
    pub result: Result<Vec<u8>, String>,
    pub events: Vec<Event>,
}

impl CommandOutcome {
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            result: Ok(value),
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            events: Vec::new(),
        }
    }
}

/// A deterministic, user-supplied state machine backing one named service.
///
/// All methods run serialized on the service's own single-threaded actor,
/// so implementations need no internal locking. Methods take `&mut
/// self` (or `&self` for `apply_query`) and must be deterministic: given the
/// same sequence of calls, every replica must produce the same results.
#[async_trait]
pub trait Service: Send + 'static {
    /// Invoked once when a new session is opened against this service.
    async fn open_session(&mut self, index: u64, ts: u64, session_id: SessionId) -> anyhow::Result<()>;

    /// Invoked once when a session is explicitly closed.
    async fn close_session(&mut self, index: u64, ts: u64, session_id: SessionId);

    /// Invoked once when a session is declared expired by `complete_keep_alive`.
    /// May produce events visible to other sessions (e.g. a "peer left" notice).
    async fn on_expire(&mut self, index: u64, ts: u64, session_id: SessionId) -> Vec<Event>;

    /// Execute a mutating operation. Exactly-once per `(session_id, sequence)`
    /// is enforced by the Apply Engine's command cache; this method is only
    /// ever invoked for a sequence not already cached.
    async fn apply_command(
        &mut self,
        index: u64,
        ts: u64,
        session_id: SessionId,
        op: &Operation,
    ) -> CommandOutcome;

    /// Execute a read-only operation against current state. Must not mutate
    /// state and must not produce events.
    async fn apply_query(&self, ts: u64, op: &Operation) -> Result<Vec<u8>, String>;

    /// Serialize complete state for a snapshot taken at `index`.
    async fn snapshot(&self, index: u64) -> anyhow::Result<Vec<u8>>;

    /// Restore state from a snapshot previously produced by `snapshot`.
    async fn restore(&mut self, index: u64, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Constructs a fresh [`Service`] instance for a service name the first time
/// it is referenced by an `OpenSession` entry. Returns `None` for an
/// unrecognized `service_type`, which the caller reports as `UnknownService`.
pub trait ServiceFactory: Send + Sync + 'static {
    fn create(&self, service_type: &str) -> Option<Box<dyn Service>>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&str) -> Option<Box<dyn Service>> + Send + Sync + 'static,
{
    fn create(&self, service_type: &str) -> Option<Box<dyn Service>> {
        self(service_type)
    }
}

enum ServiceMsg {
    OpenSession {
        index: u64,
        ts: u64,
        session_id: SessionId,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    CloseSession {
        index: u64,
        ts: u64,
        session_id: SessionId,
        reply: oneshot::Sender<()>,
    },
    Expire {
        index: u64,
        ts: u64,
        session_id: SessionId,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Command {
        index: u64,
        ts: u64,
        session_id: SessionId,
        op: Operation,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Query {
        ts: u64,
        op: Operation,
        reply: oneshot::Sender<Result<Vec<u8>, String>>,
    },
    Snapshot {
        index: u64,
        reply: oneshot::Sender<anyhow::Result<Vec<u8>>>,
    },
    Restore {
        index: u64,
        bytes: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// A handle to a spawned, single-threaded service actor.
struct ServiceActorHandle {
    tx: mpsc::UnboundedSender<ServiceMsg>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl ServiceActorHandle {
    fn spawn(name: String, inner: Box<dyn Service>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle =
            tokio::spawn(ServiceActorHandle::run(inner, rx).instrument(tracing::debug_span!("service", name = %name)));
        Self { tx, handle }
    }

    async fn run(mut inner: Box<dyn Service>, mut rx: mpsc::UnboundedReceiver<ServiceMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ServiceMsg::OpenSession {
                    index,
                    ts,
                    session_id,
                    reply,
                } => {
                    let res = inner.open_session(index, ts, session_id).await;
                    let _ = reply.send(res);
                }
                ServiceMsg::CloseSession {
                    index,
                    ts,
                    session_id,
                    reply,
                } => {
                    inner.close_session(index, ts, session_id).await;
                    let _ = reply.send(());
                }
                ServiceMsg::Expire {
                    index,
                    ts,
                    session_id,
                    reply,
                } => {
                    let events = inner.on_expire(index, ts, session_id).await;
                    let _ = reply.send(events);
                }
                ServiceMsg::Command {
                    index,
                    ts,
                    session_id,
                    op,
                    reply,
                } => {
                    let outcome = inner.apply_command(index, ts, session_id, &op).await;
                    let _ = reply.send(outcome);
                }
                ServiceMsg::Query { ts, op, reply } => {
                    let res = inner.apply_query(ts, &op).await;
                    let _ = reply.send(res);
                }
                ServiceMsg::Snapshot { index, reply } => {
                    let res = inner.snapshot(index).await;
                    let _ = reply.send(res);
                }
                ServiceMsg::Restore { index, bytes, reply } => {
                    let res = inner.restore(index, &bytes).await;
                    let _ = reply.send(res);
                }
            }
        }
        tracing::debug!("service actor shutting down");
    }
}

/// Per-named-service execution environment.
///
/// Owns the actor running the user's [`Service`] implementation; the Apply
/// Engine hands off command/query execution here and awaits completion
/// before resolving a reply. Session state itself is *not* stored here — it
/// lives in the Apply Engine's global session table — this type tracks only
/// what the registry needs to enforce the service lifecycle invariant
/// (destroyed only once all sessions are gone and compacted).
pub struct ServiceContext {
    pub name: String,
    pub service_type: String,
    /// The log index of the `OpenSession` entry that first created this
    /// service.
    pub service_id: u64,
    pub last_applied_index: u64,
    pub last_compacted_index: u64,
    actor: ServiceActorHandle,
}

impl ServiceContext {
    fn new(name: String, service_type: String, service_id: u64, inner: Box<dyn Service>) -> Self {
        Self {
            actor: ServiceActorHandle::spawn(name.clone(), inner),
            name,
            service_type,
            service_id,
            last_applied_index: 0,
            last_compacted_index: 0,
        }
    }

    pub async fn open_session(&mut self, index: u64, ts: u64, session_id: SessionId) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .tx
            .send(ServiceMsg::OpenSession {
                index,
                ts,
                session_id,
                reply: tx,
            })
            .map_err(|_| anyhow::anyhow!("service actor for {:?} is gone", self.name))?;
        let res = rx.await.map_err(|_| anyhow::anyhow!("service actor for {:?} dropped reply", self.name))?;
        self.last_applied_index = index;
        res
    }

    pub async fn close_session(&mut self, index: u64, ts: u64, session_id: SessionId) {
        let (tx, rx) = oneshot::channel();
        if self
            .actor
            .tx
            .send(ServiceMsg::CloseSession {
                index,
                ts,
                session_id,
                reply: tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
        self.last_applied_index = index;
    }

    pub async fn expire_session(&mut self, index: u64, ts: u64, session_id: SessionId) -> Vec<Event> {
        let (tx, rx) = oneshot::channel();
        let events = if self
            .actor
            .tx
            .send(ServiceMsg::Expire {
                index,
                ts,
                session_id,
                reply: tx,
            })
            .is_ok()
        {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        };
        self.last_applied_index = index;
        events
    }

    pub async fn command(&mut self, index: u64, ts: u64, session_id: SessionId, op: Operation) -> CommandOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .actor
            .tx
            .send(ServiceMsg::Command {
                index,
                ts,
                session_id,
                op,
                reply: tx,
            })
            .is_ok()
        {
            self.last_applied_index = index;
            rx.await.unwrap_or_else(|_| CommandOutcome::err("service actor dropped reply"))
        } else {
            CommandOutcome::err("service actor is gone")
        }
    }

    pub async fn query(&self, ts: u64, op: Operation) -> Result<Vec<u8>, String> {
        let (tx, rx) = oneshot::channel();
        if self.actor.tx.send(ServiceMsg::Query { ts, op, reply: tx }).is_ok() {
            rx.await.unwrap_or_else(|_| Err("service actor dropped reply".into()))
        } else {
            Err("service actor is gone".into())
        }
    }

    pub async fn take_snapshot(&mut self, index: u64) -> anyhow::Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .tx
            .send(ServiceMsg::Snapshot { index, reply: tx })
            .map_err(|_| anyhow::anyhow!("service actor for {:?} is gone", self.name))?;
        let bytes = rx.await.map_err(|_| anyhow::anyhow!("service actor dropped reply"))??;
        Ok(bytes)
    }

    pub fn complete_snapshot(&mut self, index: u64) {
        self.last_compacted_index = index;
    }

    pub async fn restore(&mut self, index: u64, bytes: Vec<u8>) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .tx
            .send(ServiceMsg::Restore { index, bytes, reply: tx })
            .map_err(|_| anyhow::anyhow!("service actor for {:?} is gone", self.name))?;
        rx.await.map_err(|_| anyhow::anyhow!("service actor dropped reply"))??;
        self.last_applied_index = index;
        self.last_compacted_index = index;
        Ok(())
    }
}

/// Creates and tracks one [`ServiceContext`] per named service.
pub struct ServiceRegistry {
    factory: Arc<dyn ServiceFactory>,
    services: IndexMap<String, ServiceContext>,
}

impl ServiceRegistry {
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            factory,
            services: IndexMap::new(),
        }
    }

    /// Ensure a `ServiceContext` exists for `name`, creating it via the
    /// factory if this is the first reference.
    pub fn ensure(&mut self, name: &str, service_type: &str, created_at_index: u64) -> Option<&mut ServiceContext> {
        if !self.services.contains_key(name) {
            let inner = self.factory.create(service_type)?;
            self.services.insert(
                name.to_string(),
                ServiceContext::new(name.to_string(), service_type.to_string(), created_at_index, inner),
            );
        }
        self.services.get_mut(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceContext> {
        self.services.get_mut(name)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceContext> {
        self.services.get(name)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ServiceContext)> {
        self.services.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceContext)> {
        self.services.iter()
    }

    /// Remove a service once every session of its has been compacted away.
    /// The caller is responsible for deciding eligibility (no sessions left
    /// referencing the name); this method just drops the entry and its actor.
    pub fn remove(&mut self, name: &str) -> Option<ServiceContext> {
        self.services.shift_remove(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Metadata about a session, as returned by a `Metadata` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub service_name: String,
    pub service_type: String,
}
