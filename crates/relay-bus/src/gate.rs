use std::time::{Duration, Instant};

use dashmap::DashMap;

use relay_core::events::Event;
use relay_core::ids::RunId;
use relay_store::runs::{RunStatus, RunTaskRepo};
use relay_store::{Database, StoreError};

use crate::error::BusError;

const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(500);

struct CachedStatus {
    status: RunStatus,
    fetched_at: Instant,
}

/// Shared admission check consulted before every subscriber delivery.
///
/// Events without a run tag and allowlisted termination notices always
/// pass. Everything else passes only while the tagged run is RUNNING, so
/// a slow agent loop cannot produce late side effects after its run was
/// declared over.
///
/// Status lookups go through a short-TTL cache to bound store load. Code
/// paths in this crate family that terminate a run call `invalidate`
/// before publishing, so their suppression takes effect immediately; only
/// status changes written by parties outside the core can ride the TTL
/// window. Terminal statuses are cached without expiry — a terminal task
/// never changes again.
pub struct RunGate {
    runs: RunTaskRepo,
    cache: DashMap<RunId, CachedStatus>,
    ttl: Duration,
}

impl RunGate {
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, DEFAULT_CACHE_TTL)
    }

    /// A TTL of zero disables caching (the source-of-truth re-query
    /// behavior).
    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        Self {
            runs: RunTaskRepo::new(db),
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Whether the event may be delivered to subscribers.
    ///
    /// An event tagged with a run id that has no backing row is a fatal
    /// integrity fault and surfaces as an error, not as suppression.
    pub fn should_handle(&self, event: &Event) -> Result<bool, BusError> {
        let Some(run_id) = &event.run_id else {
            return Ok(true);
        };
        if event.event_type.always_deliver() {
            return Ok(true);
        }

        Ok(self.status_of(run_id)? == RunStatus::Running)
    }

    /// Drop any cached status for a run. Called by terminating code paths
    /// (cancel handler, reaper) right after their status write commits.
    pub fn invalidate(&self, run_id: &RunId) {
        self.cache.remove(run_id);
    }

    fn status_of(&self, run_id: &RunId) -> Result<RunStatus, BusError> {
        if let Some(entry) = self.cache.get(run_id) {
            if entry.status.is_terminal() || entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.status);
            }
        }

        let row = self.runs.get(run_id).map_err(|e| match e {
            StoreError::NotFound(_) => BusError::RunMissing(run_id.to_string()),
            other => BusError::Store(other),
        })?;

        self.cache.insert(
            run_id.clone(),
            CachedStatus {
                status: row.status,
                fetched_at: Instant::now(),
            },
        );
        Ok(row.status)
    }
}
