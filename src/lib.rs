//! A replicated state-machine runtime: session-aware client dispatch and
//! deterministic log application layered over an externally supplied,
//! already-replicated commit log.
//!
//! This crate does not implement leader election, log replication, or wire
//! framing for `AppendEntries`/`RequestVote` — those are the responsibility
//! of the consensus layer a deployment plugs in through [`log_cursor::CommittedLog`].
//! What lives here is everything downstream of "the log is committed":
//! session lifecycle, exactly-once command application, service isolation,
//! snapshotting, and the client-side dispatcher that talks to it.

pub mod apply;
pub mod client;
pub mod cluster;
pub mod compactor;
pub mod config;
pub mod demo_kv;
pub mod entry;
pub mod error;
pub mod ids;
pub mod log_cursor;
pub mod metrics;
pub mod service;
pub mod session;

pub use apply::ApplyEngineHandle;
pub use apply::ServiceSnapshot;
pub use client::ClusterTransport;
pub use client::DispatcherHandle;
pub use cluster::ClusterView;
pub use cluster::Member;
pub use cluster::Role;
pub use compactor::Compactor;
pub use config::Config;
pub use entry::EntryPayload;
pub use entry::LogEntry;
pub use entry::Operation;
pub use entry::OperationResult;
pub use entry::ReadConsistency;
pub use error::DispatchError;
pub use error::RsmError;
pub use ids::ClientId;
pub use ids::MemberId;
pub use ids::OperationId;
pub use ids::SessionId;
pub use log_cursor::CommittedLog;
pub use service::CommandOutcome;
pub use service::Event;
pub use service::EventTarget;
pub use service::Service;
pub use service::ServiceFactory;
