//! The external consensus collaborator: a committed, ordered log exposing a
//! cursor interface plus the hooks the Compactor needs.
//!
//! This crate does not implement leader election, log replication, or
//! `AppendEntries` — those live in the consensus layer referenced here only
//! through this trait.

use async_trait::async_trait;

use crate::entry::LogEntry;

/// Read access to the committed, ordered log maintained by the consensus
/// layer, plus the minimal compaction control surface the Compactor needs.
///
/// Implementations must guarantee that `read(index)` for any previously
/// committed `index` keeps returning the same entry for the lifetime of the
/// log (until it is truncated below that index), and that entries are never
/// skipped: if `read(i)` returns `Some`, every `j < i` that was ever
/// committed has already been durable.
#[async_trait]
pub trait CommittedLog: Send + Sync + 'static {
    /// Read the committed entry at `index`, if it has been committed yet.
    async fn read(&self, index: u64) -> anyhow::Result<Option<LogEntry>>;

    /// The index of the most recently committed entry, or 0 if the log is
    /// empty.
    async fn last_committed_index(&self) -> anyhow::Result<u64>;

    /// Whether the log considers `index` safe to compact beneath, i.e. the
    /// consensus layer has durably committed everything up to `index` on a
    /// quorum and no replica still needs entries at or below it for catch-up.
    async fn is_compactable(&self, index: u64) -> anyhow::Result<bool>;

    /// Instruct the log to discard all entries at or below `index`. Called
    /// only after every service has confirmed its snapshot at `index` is
    /// durable.
    async fn truncate_through(&self, index: u64) -> anyhow::Result<()>;
}
