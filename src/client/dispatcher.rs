//! The Client Dispatcher: session registration, sticky leader discovery,
//! per-session command sequencing, and keep-alive/session-loss recovery.
//! Structured as an actor, mirroring [`crate::apply::ApplyEngineCore`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client::transport::ClusterTransport;
use crate::client::transport::CloseSessionRequest;
use crate::client::transport::CommandRequest;
use crate::client::transport::KeepAliveRequest;
use crate::client::transport::QueryRequest;
use crate::client::transport::RegisterRequest;
use crate::cluster::ClusterView;
use crate::config::Config;
use crate::entry::Operation;
use crate::entry::ReadConsistency;
use crate::error::DispatchError;
use crate::error::OperationError;
use crate::error::RsmError;
use crate::ids::ClientId;
use crate::ids::MemberId;
use crate::ids::SessionId;
use crate::metrics::DispatcherMetrics;

/// Public handle to a running dispatcher.
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    rx_metrics: watch::Receiver<DispatcherMetrics>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    /// `session_timeout_ms` is the caller-supplied session lease: how long
    /// the server will tolerate a gap between `KeepAlive`s before declaring
    /// the session expired. It is independent of `config.request_timeout_ms`,
    /// which bounds a single RPC attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        transport: Arc<dyn ClusterTransport>,
        seed_members: Vec<MemberId>,
        service_name: impl Into<String>,
        service_type: impl Into<String>,
        read_consistency: ReadConsistency,
        session_timeout_ms: u64,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(DispatcherMetrics::default());
        let join = DispatcherCore::spawn(
            config,
            transport,
            seed_members,
            service_name.into(),
            service_type.into(),
            read_consistency,
            session_timeout_ms,
            rx,
            tx_metrics,
        );
        Self {
            tx,
            rx_metrics,
            join: Mutex::new(Some(join)),
        }
    }

    /// Register a session and start the keep-alive loop. Idempotent: calling
    /// `open` while already open is a no-op success.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open(&self) -> Result<(), DispatchError> {
        self.call(|reply| DispatcherMsg::Open { reply }).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> Result<(), DispatchError> {
        self.call(|reply| DispatcherMsg::Close { reply }).await
    }

    #[tracing::instrument(level = "debug", skip(self, op))]
    pub async fn submit_command(&self, op: Operation) -> Result<Vec<u8>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::SubmitCommand { op, reply: tx })
            .map_err(|_| DispatchError::NotOpen)?;
        rx.await.map_err(|_| DispatchError::NotOpen)?
    }

    #[tracing::instrument(level = "debug", skip(self, op))]
    pub async fn submit_query(&self, op: Operation) -> Result<Vec<u8>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::SubmitQuery { op, reply: tx })
            .map_err(|_| DispatchError::NotOpen)?;
        rx.await.map_err(|_| DispatchError::NotOpen)?
    }

    pub fn metrics(&self) -> watch::Receiver<DispatcherMetrics> {
        self.rx_metrics.clone()
    }

    pub async fn shutdown(&self) {
        drop(self.tx.clone());
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn call<F>(&self, build: F) -> Result<(), DispatchError>
    where
        F: FnOnce(oneshot::Sender<Result<(), DispatchError>>) -> DispatcherMsg,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).map_err(|_| DispatchError::NotOpen)?;
        rx.await.map_err(|_| DispatchError::NotOpen)?
    }
}

/// Double `current`, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

enum DispatcherMsg {
    Open {
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    SubmitCommand {
        op: Operation,
        reply: oneshot::Sender<Result<Vec<u8>, DispatchError>>,
    },
    SubmitQuery {
        op: Operation,
        reply: oneshot::Sender<Result<Vec<u8>, DispatchError>>,
    },
    KeepAliveTick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DispatcherStatus {
    Closed,
    Open,
}

/// Client-side mirror of a session, just enough to sequence commands and
/// trim acknowledged cache entries on the server via `KeepAlive`.
struct ClientSessionView {
    id: SessionId,
    command_sequence: u64,
    event_index: u64,
}

struct DispatcherCore {
    config: Config,
    transport: Arc<dyn ClusterTransport>,
    client_id: ClientId,
    service_name: String,
    service_type: String,
    read_consistency: ReadConsistency,
    session_timeout_ms: u64,
    members: Vec<MemberId>,
    leader: Option<MemberId>,
    session: Option<ClientSessionView>,
    status: DispatcherStatus,
    tx_metrics: watch::Sender<DispatcherMetrics>,
    rx_api: mpsc::UnboundedReceiver<DispatcherMsg>,
}

impl DispatcherCore {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        config: Config,
        transport: Arc<dyn ClusterTransport>,
        seed_members: Vec<MemberId>,
        service_name: String,
        service_type: String,
        read_consistency: ReadConsistency,
        session_timeout_ms: u64,
        rx_api: mpsc::UnboundedReceiver<DispatcherMsg>,
        tx_metrics: watch::Sender<DispatcherMetrics>,
    ) -> JoinHandle<()> {
        let this = Self {
            config,
            transport,
            client_id: ClientId::generate(),
            service_name,
            service_type,
            read_consistency,
            session_timeout_ms,
            members: seed_members,
            leader: None,
            session: None,
            status: DispatcherStatus::Closed,
            tx_metrics,
            rx_api,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("dispatcher")))
    }

    async fn main(mut self) {
        let keep_alive_interval = Duration::from_millis(self.config.keep_alive_interval_ms);
        let mut ticker = tokio::time::interval(keep_alive_interval);
        loop {
            tokio::select! {
                msg = self.rx_api.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.handle(DispatcherMsg::KeepAliveTick).await;
                }
            }
            self.report_metrics();
        }
    }

    fn report_metrics(&self) {
        let _ = self.tx_metrics.send(DispatcherMetrics {
            session_id: self.session.as_ref().map(|s| s.id.0),
            session_version: self.session.as_ref().map(|s| s.event_index).unwrap_or(0),
            is_open: self.status == DispatcherStatus::Open,
            current_leader: self.leader.map(|m| m.0),
        });
    }

    async fn handle(&mut self, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Open { reply } => {
                let res = self.open().await;
                let _ = reply.send(res);
            }
            DispatcherMsg::Close { reply } => {
                let res = self.close().await;
                let _ = reply.send(res);
            }
            DispatcherMsg::SubmitCommand { op, reply } => {
                let res = self.submit_command(op).await;
                let _ = reply.send(res);
            }
            DispatcherMsg::SubmitQuery { op, reply } => {
                let res = self.submit_query(op).await;
                let _ = reply.send(res);
            }
            DispatcherMsg::KeepAliveTick => {
                if self.status == DispatcherStatus::Open {
                    if let Err(err) = self.keep_alive().await {
                        tracing::warn!(error = %err, "keep-alive failed");
                        if matches!(err, RsmError::UnknownSession(_)) && self.recover_lost_session().await.is_err() {
                            self.status = DispatcherStatus::Closed;
                        }
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> Result<(), DispatchError> {
        if self.status == DispatcherStatus::Open {
            return Ok(());
        }
        self.register().await?;
        self.status = DispatcherStatus::Open;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DispatchError> {
        if let (DispatcherStatus::Open, Some(session)) = (self.status, &self.session) {
            if let Some(leader) = self.leader {
                let _ = self
                    .transport
                    .close_session(leader, CloseSessionRequest { session_id: session.id })
                    .await;
            }
        }
        self.session = None;
        self.status = DispatcherStatus::Closed;
        Ok(())
    }

    /// Register with exponential backoff, doubling from
    /// `register_backoff_initial_ms` up to `register_backoff_max_ms`, one
    /// attempt in flight at a time.
    async fn register(&mut self) -> Result<(), DispatchError> {
        let mut backoff = Duration::from_millis(self.config.register_backoff_initial_ms);
        let max_backoff = Duration::from_millis(self.config.register_backoff_max_ms);
        loop {
            let target = match self.current_or_discover_leader().await {
                Ok(target) => target,
                Err(err) if err.is_retryable() => {
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, max_backoff);
                    continue;
                }
                Err(err) => return Err(DispatchError::Rsm(err)),
            };

            let req = RegisterRequest {
                cluster_name: self.config.cluster_name.clone(),
                client_id: self.client_id,
                service_name: self.service_name.clone(),
                service_type: self.service_type.clone(),
                read_consistency: self.read_consistency,
                timeout_ms: self.session_timeout_ms,
            };
            match self.with_timeout(self.transport.register(target, req)).await {
                Ok(resp) => {
                    self.session = Some(ClientSessionView {
                        id: resp.session_id,
                        command_sequence: 0,
                        event_index: 0,
                    });
                    self.leader = Some(target);
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    if matches!(err, RsmError::NoLeader) {
                        self.leader = None;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, max_backoff);
                }
                Err(err) => return Err(DispatchError::Rsm(err)),
            }
        }
    }

    /// Submit a command, transparently recovering from a server-forgotten
    /// session: if the server reports `UnknownSession`, this registers a
    /// fresh session and resubmits the same operation under the new
    /// `session_id`, so the caller never observes the loss.
    async fn submit_command(&mut self, op: Operation) -> Result<Vec<u8>, DispatchError> {
        if self.status != DispatcherStatus::Open {
            return Err(DispatchError::NotOpen);
        }

        loop {
            let (session_id, sequence, version) = {
                let session = self.session.as_ref().ok_or(DispatchError::SessionNotOpen)?;
                (session.id, session.command_sequence + 1, session.event_index)
            };
            let target = self
                .current_or_discover_leader()
                .await
                .map_err(DispatchError::Rsm)?;
            let req = CommandRequest {
                session_id,
                sequence,
                version,
                op: op.clone(),
            };
            match self.with_timeout(self.transport.submit_command(target, req)).await {
                Ok(result) => match result.outcome {
                    Ok(value) => {
                        if let Some(session) = self.session.as_mut() {
                            session.command_sequence = sequence;
                            session.event_index = result.event_index.max(session.event_index);
                        }
                        return Ok(value);
                    }
                    Err(OperationError::UnknownSession(_)) => {
                        self.recover_lost_session().await?;
                        continue;
                    }
                    Err(other) => return Err(DispatchError::Rsm(other.into())),
                },
                Err(err) if err.is_retryable() => {
                    if matches!(err, RsmError::NoLeader) {
                        self.leader = None;
                    }
                    continue;
                }
                Err(err) => return Err(DispatchError::Rsm(err)),
            }
        }
    }

    async fn submit_query(&mut self, op: Operation) -> Result<Vec<u8>, DispatchError> {
        if self.status != DispatcherStatus::Open {
            return Err(DispatchError::NotOpen);
        }
        loop {
            let (session_id, version) = {
                let session = self.session.as_ref().ok_or(DispatchError::SessionNotOpen)?;
                (session.id, session.event_index)
            };
            let target = self
                .current_or_discover_leader()
                .await
                .map_err(DispatchError::Rsm)?;
            let req = QueryRequest {
                session_id,
                service_name: self.service_name.clone(),
                version,
                op: op.clone(),
            };
            match self.with_timeout(self.transport.submit_query(target, req)).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if matches!(err, RsmError::NoLeader) {
                        self.leader = None;
                    }
                    continue;
                }
                Err(RsmError::UnknownSession(_)) => {
                    self.recover_lost_session().await?;
                    continue;
                }
                Err(err) => return Err(DispatchError::Rsm(err)),
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<(), RsmError> {
        let target = self.current_or_discover_leader().await?;
        let (session_id, acknowledged_sequence, acknowledged_event_index) = {
            let session = self.session.as_ref().ok_or(RsmError::NotOpen)?;
            (session.id, session.command_sequence, session.event_index)
        };
        self.with_timeout(self.transport.keep_alive(
            target,
            KeepAliveRequest {
                session_id,
                acknowledged_sequence,
                acknowledged_event_index,
            },
        ))
        .await
    }

    /// A session expired or was otherwise forgotten by the server: drop it
    /// and transparently register a fresh one, so the retry loop in
    /// `submit_command`/`submit_query` can resubmit under the new
    /// `session_id` without the caller observing the loss. Only a failure of
    /// `register()` itself should close the dispatcher; the caller decides
    /// that.
    async fn recover_lost_session(&mut self) -> Result<(), DispatchError> {
        self.session = None;
        self.register().await
    }

    /// Return the sticky leader guess, or ask a member for its current view
    /// when none is known.
    async fn current_or_discover_leader(&mut self) -> Result<MemberId, RsmError> {
        if let Some(leader) = self.leader {
            return Ok(leader);
        }
        for &member in &self.members.clone() {
            if let Ok(view) = self.with_timeout(self.transport.current_view(member)).await {
                if let Some(leader) = self.leader_from_view(view) {
                    self.leader = Some(leader);
                    return Ok(leader);
                }
            }
        }
        Err(RsmError::NoLeader)
    }

    fn leader_from_view(&mut self, view: ClusterView) -> Option<MemberId> {
        self.members = view.members().iter().map(|m| m.id).collect();
        view.leader
    }

    async fn with_timeout<F, T>(&self, fut: F) -> Result<T, RsmError>
    where
        F: std::future::Future<Output = Result<T, RsmError>>,
    {
        tokio::time::timeout(Duration::from_millis(self.config.request_timeout_ms), fut)
            .await
            .unwrap_or(Err(RsmError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_backoff_doubles_until_it_hits_the_cap() {
        let max = Duration::from_millis(1_000);
        let mut backoff = Duration::from_millis(100);
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(200));
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(400));
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(800));
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, max, "doubling past the cap must clamp to it");
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, max, "once at the cap it must stay there");
    }
}
