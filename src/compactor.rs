//! Periodic log compaction: snapshots every service once the consensus layer
//! says an index is safe to compact beneath, then truncates the log. Driven
//! on a timer against a running [`ApplyEngineHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::apply::ApplyEngineHandle;
pub use crate::apply::CompactionReport;

/// Drives periodic compaction against a running [`ApplyEngineHandle`].
pub struct Compactor {
    engine: Arc<ApplyEngineHandle>,
    interval: Duration,
}

impl Compactor {
    pub fn new(engine: Arc<ApplyEngineHandle>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run a single compaction cycle. Exposed directly so tests can drive
    /// compaction deterministically instead of waiting on the timer loop.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self) -> anyhow::Result<CompactionReport> {
        self.engine.compact().await
    }

    /// Spawn a background loop calling [`Compactor::tick`] on `interval`
    /// forever, logging but not propagating failures: compaction failure
    /// must never halt the applier.
    pub fn spawn_loop(self) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                loop {
                    ticker.tick().await;
                    match self.tick().await {
                        Ok(report) => {
                            if report.truncated_through.is_some() {
                                tracing::debug!(?report, "compaction cycle completed");
                            }
                        }
                        Err(err) => tracing::error!(error = %err, "compaction cycle failed"),
                    }
                }
            }
            .instrument(tracing::debug_span!("compactor")),
        )
    }
}
