use std::path::Path;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SweepConfig;
use crate::scheduler::batch::{BatchCompleter, BatchOutcome};

/// Periodically completes pending jobs.
pub struct Sweeper {
    completer: BatchCompleter,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(completer: BatchCompleter, config: SweepConfig) -> Self {
        Self { completer, config }
    }

    /// Sweep once per interval until `shutdown` is cancelled.
    ///
    /// The first sweep happens one full interval after start. A failed sweep
    /// is logged and the loop keeps going.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        tracing::info!(interval_ms = self.config.interval.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Run one batch completion, log the result, and append it to the sweep
    /// log if one is configured. Returns `None` if the batch failed.
    pub async fn sweep_once(&self) -> Option<BatchOutcome> {
        tracing::debug!("Sweep started");

        let (outcome, line) = match self.completer.run().await {
            Ok(outcome) => {
                if outcome.count > 0 {
                    tracing::info!(count = outcome.count, ids = ?outcome.ids, "Completed pending jobs");
                } else {
                    tracing::debug!("No pending jobs to complete");
                }
                let line = format!(
                    "[{}] Updated {} pending jobs to completed",
                    Utc::now().to_rfc3339(),
                    outcome.count
                );
                (Some(outcome), line)
            }
            Err(e) => {
                tracing::error!(error = %e, "Sweep failed");
                let line = format!(
                    "[{}] Error updating pending jobs: {}",
                    Utc::now().to_rfc3339(),
                    e
                );
                (None, line)
            }
        };

        if let Some(path) = &self.config.log_path {
            if let Err(e) = append_line(path, &line).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write sweep log");
            }
        }

        outcome
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
