use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use relay_core::events::EventType;
use relay_core::ids::{RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::{insert_event, EventLogRow};
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
    SystemInterrupted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::SystemInterrupted => write!(f, "system_interrupted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "system_interrupted" => Ok(Self::SystemInterrupted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution of the agent loop within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunTaskRow {
    pub id: RunId,
    pub session_id: SessionId,
    pub status: RunStatus,
    pub version: i64,
    pub user_message_id: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a compare-and-swap status update. Conflict means the row
/// exists but was mutated since the version was read; "not found" stays a
/// separate error so callers can tell the two apart.
#[derive(Debug)]
pub enum CasOutcome {
    Updated(RunTaskRow),
    Conflict,
}

/// Result of one reaper claim-round.
#[derive(Debug, Default)]
pub struct ReapBatch {
    pub events: Vec<EventLogRow>,
    pub interrupted: usize,
    pub failed: usize,
}

const SELECT_COLUMNS: &str = "id, session_id, status, version, user_message_id, claimed_by, claimed_at, created_at, updated_at";

pub struct RunTaskRepo {
    db: Database,
}

impl RunTaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new RUNNING task at version 0.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn create(
        &self,
        session_id: &SessionId,
        user_message_id: Option<&str>,
    ) -> Result<RunTaskRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_tasks (id, session_id, status, version, user_message_id, created_at, updated_at)
                 VALUES (?1, ?2, 'running', 0, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), user_message_id, now, now],
            )?;

            Ok(RunTaskRow {
                id,
                session_id: session_id.clone(),
                status: RunStatus::Running,
                version: 0,
                user_message_id: user_message_id.map(str::to_string),
                claimed_by: None,
                claimed_at: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a task by id.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunTaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM run_tasks WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("run task {id}"))),
            }
        })
    }

    /// The most recent RUNNING task for a session, if any.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn find_running_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<RunTaskRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM run_tasks
                 WHERE session_id = ?1 AND status = 'running'
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_task(row)?)),
                None => Ok(None),
            }
        })
    }

    /// All tasks for a session, newest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<RunTaskRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM run_tasks
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    /// Compare-and-swap status transition away from RUNNING.
    ///
    /// The update is a single conditional statement on `(id, version)`;
    /// an affected-row count of zero is disambiguated into Conflict (row
    /// exists, someone else won) vs NotFound (no such task). RUNNING is
    /// never a valid target — a new run gets a new id.
    #[instrument(skip(self), fields(run_id = %id, expected_version, new_status = %new_status))]
    pub fn update_status(
        &self,
        id: &RunId,
        expected_version: i64,
        new_status: RunStatus,
    ) -> Result<CasOutcome, StoreError> {
        if new_status == RunStatus::Running {
            return Err(StoreError::InvalidTransition(
                "a task never transitions back to running".into(),
            ));
        }

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE run_tasks SET status = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4 AND status = 'running'",
                rusqlite::params![new_status.to_string(), now, id.as_str(), expected_version],
            )?;

            if changed == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM run_tasks WHERE id = ?1)",
                    [id.as_str()],
                    |row| row.get(0),
                )?;
                return if exists {
                    Ok(CasOutcome::Conflict)
                } else {
                    Err(StoreError::NotFound(format!("run task {id}")))
                };
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM run_tasks WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(CasOutcome::Updated(row_to_task(row)?)),
                None => Err(StoreError::NotFound(format!("run task {id}"))),
            }
        })
    }

    /// One reaper claim-round, in a single transaction: claim up to
    /// `batch_size` RUNNING rows older than `cutoff` whose claim is absent
    /// or abandoned (older than `claim_cutoff`), flip each to
    /// SYSTEM_INTERRUPTED, and append the termination event to the
    /// session's log so the status write and the persisted event commit
    /// together. Per-row failures release that row's claim and are
    /// reported in the batch result instead of aborting the round.
    ///
    /// `claim_token` must be unique per round; rows claimed under another
    /// live token are invisible to this round.
    #[instrument(skip(self), fields(claim_token, batch_size))]
    pub fn interrupt_stale_batch(
        &self,
        cutoff: &str,
        claim_cutoff: &str,
        batch_size: u32,
        claim_token: &str,
    ) -> Result<ReapBatch, StoreError> {
        self.db.with_tx(|tx| {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE run_tasks SET claimed_by = ?1, claimed_at = ?2
                 WHERE id IN (
                     SELECT id FROM run_tasks
                     WHERE status = 'running' AND created_at < ?3
                       AND (claimed_by IS NULL OR claimed_at < ?4)
                     ORDER BY created_at ASC
                     LIMIT ?5)",
                rusqlite::params![claim_token, now, cutoff, claim_cutoff, batch_size],
            )?;

            let claimed = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM run_tasks
                     WHERE claimed_by = ?1 AND status = 'running'
                     ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query([claim_token])?;
                let mut tasks = Vec::new();
                while let Some(row) = rows.next()? {
                    tasks.push(row_to_task(row)?);
                }
                tasks
            };

            let mut batch = ReapBatch::default();
            for task in &claimed {
                match interrupt_one(tx, task) {
                    Ok(event) => {
                        batch.events.push(event);
                        batch.interrupted += 1;
                    }
                    Err(e) => {
                        warn!(run_id = %task.id, error = %e, "failed to interrupt stale run");
                        let _ = tx.execute(
                            "UPDATE run_tasks SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
                            [task.id.as_str()],
                        );
                        batch.failed += 1;
                    }
                }
            }
            Ok(batch)
        })
    }
}

fn interrupt_one(
    tx: &rusqlite::Transaction<'_>,
    task: &RunTaskRow,
) -> Result<EventLogRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    let changed = tx.execute(
        "UPDATE run_tasks SET status = 'system_interrupted', version = version + 1, updated_at = ?1
         WHERE id = ?2 AND version = ?3 AND status = 'running'",
        rusqlite::params![now, task.id.as_str(), task.version],
    )?;
    if changed == 0 {
        return Err(StoreError::Database(format!(
            "concurrent update while interrupting {}",
            task.id
        )));
    }

    insert_event(
        tx,
        &task.session_id,
        Some(&task.id),
        EventType::RunInterrupted.as_str(),
        serde_json::json!({
            "reason": "run_timeout",
            "status": "SYSTEM_INTERRUPTED",
        }),
    )
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<RunTaskRow, StoreError> {
    let status_str: String = row_helpers::get(row, 2, "run_tasks", "status")?;

    Ok(RunTaskRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "run_tasks", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "run_tasks",
            "session_id",
        )?),
        status: row_helpers::parse_enum(&status_str, "run_tasks", "status")?,
        version: row_helpers::get(row, 3, "run_tasks", "version")?,
        user_message_id: row_helpers::get_opt(row, 4, "run_tasks", "user_message_id")?,
        claimed_by: row_helpers::get_opt(row, 5, "run_tasks", "claimed_by")?,
        claimed_at: row_helpers::get_opt(row, 6, "run_tasks", "claimed_at")?,
        created_at: row_helpers::get(row, 7, "run_tasks", "created_at")?,
        updated_at: row_helpers::get(row, 8, "run_tasks", "updated_at")?,
    })
}
