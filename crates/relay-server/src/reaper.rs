//! Periodic reclamation of runs that have been RUNNING too long.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use relay_bus::EventBus;
use relay_core::events::{Event, EventType};
use relay_store::runs::RunTaskRepo;
use relay_store::{Database, StoreError};
use relay_telemetry::MetricsRecorder;

#[derive(Clone, Debug)]
pub struct ReaperConfig {
    /// Sweep cadence.
    pub interval: Duration,
    /// How long a task may stay RUNNING before it is reclaimed.
    pub run_timeout: Duration,
    /// Rows claimed per round.
    pub batch_size: u32,
    /// Hard cap on rows processed per sweep, bounding worst-case sweep
    /// duration.
    pub max_per_sweep: u32,
    /// Identifies this reaper instance in row claims.
    pub claimant: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(600),
            batch_size: 50,
            max_per_sweep: 500,
            claimant: "reaper".into(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rounds: usize,
    pub interrupted: usize,
    pub failed: usize,
}

/// Claims batches of stale RUNNING tasks, flips them to
/// SYSTEM_INTERRUPTED with their termination event in one transaction,
/// and publishes those events once the batch has committed.
///
/// Claims use per-round tokens with a TTL, so overlapping sweeps and
/// other reaper instances skip rows that are already being processed and
/// recover rows whose claimant crashed.
pub struct RunReaper {
    runs: RunTaskRepo,
    bus: Arc<EventBus>,
    config: ReaperConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RunReaper {
    pub fn new(db: Database, bus: Arc<EventBus>, config: ReaperConfig) -> Self {
        Self {
            runs: RunTaskRepo::new(db),
            bus,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start sweeping on the configured interval until cancelled.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.tick().await; // consume first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep() {
                            Ok(report) if report.interrupted > 0 || report.failed > 0 => {
                                info!(
                                    interrupted = report.interrupted,
                                    failed = report.failed,
                                    rounds = report.rounds,
                                    "stale run sweep"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "stale run sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// One full sweep: claim-rounds until a round comes back short of
    /// `batch_size` or the per-sweep cap is reached.
    #[instrument(skip(self), fields(claimant = %self.config.claimant))]
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = Utc::now();
        let cutoff = (now - chrono_duration(self.config.run_timeout)).to_rfc3339();
        // Claims older than two intervals belong to a crashed or wedged
        // claimant and are up for grabs again.
        let claim_cutoff = (now - chrono_duration(self.config.interval * 2)).to_rfc3339();

        let mut report = SweepReport::default();
        loop {
            let processed = (report.interrupted + report.failed) as u32;
            if processed >= self.config.max_per_sweep {
                break;
            }
            let round_size = self
                .config
                .batch_size
                .min(self.config.max_per_sweep - processed);

            let token = format!("{}:{}", self.config.claimant, Uuid::now_v7());
            let batch =
                self.runs
                    .interrupt_stale_batch(&cutoff, &claim_cutoff, round_size, &token)?;

            report.rounds += 1;
            report.interrupted += batch.interrupted;
            report.failed += batch.failed;

            // Publish only after the batch committed. The store already
            // holds the persisted termination events; this notifies live
            // subscribers.
            for row in &batch.events {
                if let Some(run_id) = &row.run_id {
                    self.bus.gate().invalidate(run_id);
                }
                let payload = row.payload.clone();
                let event = match &row.run_id {
                    Some(run_id) => Event::for_run(
                        EventType::RunInterrupted,
                        row.session_id.clone(),
                        run_id.clone(),
                        payload,
                    ),
                    None => {
                        Event::for_session(EventType::RunInterrupted, row.session_id.clone(), payload)
                    }
                };
                self.bus.publish(event);
            }

            if let Some(metrics) = &self.metrics {
                metrics.increment_counter("reaper_interrupted_total", &[], batch.interrupted as u64);
                metrics.increment_counter("reaper_failed_total", &[], batch.failed as u64);
            }

            if (batch.interrupted + batch.failed) < round_size as usize {
                break; // exhausted
            }
        }

        Ok(report)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000))
}
