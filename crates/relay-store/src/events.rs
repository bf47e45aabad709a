use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{EventId, RunId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A persisted session event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogRow {
    pub id: EventId,
    pub session_id: SessionId,
    pub run_id: Option<RunId>,
    pub sequence: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Append-only per-session event log, ordered by a per-session sequence.
pub struct EventLogRepo {
    db: Database,
}

impl EventLogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event to a session's log.
    #[instrument(skip(self, payload), fields(session_id = %session_id, event_type))]
    pub fn append(
        &self,
        session_id: &SessionId,
        run_id: Option<&RunId>,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventLogRow, StoreError> {
        self.db
            .with_conn(|conn| insert_event(conn, session_id, run_id, event_type, payload))
    }

    /// List events for a session, ordered by sequence.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EventLogRow>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(1000);
            let offset = offset.unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, session_id, run_id, sequence, type, payload, created_at
                 FROM session_events WHERE session_id = ?1
                 ORDER BY sequence ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// List events after a given sequence number (for client catch-up).
    #[instrument(skip(self), fields(session_id = %session_id, after_sequence))]
    pub fn list_after_sequence(
        &self,
        session_id: &SessionId,
        after_sequence: i64,
        limit: u32,
    ) -> Result<Vec<EventLogRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, run_id, sequence, type, payload, created_at
                 FROM session_events WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![session_id.as_str(), after_sequence, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Count events for a session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM session_events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

/// Insert one event row, assigning the next per-session sequence in the
/// same statement. Also used inside the reaper's transaction so the
/// termination event and the status flip commit together.
pub fn insert_event(
    conn: &Connection,
    session_id: &SessionId,
    run_id: Option<&RunId>,
    event_type: &str,
    payload: serde_json::Value,
) -> Result<EventLogRow, StoreError> {
    let id = EventId::new();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO session_events (id, session_id, run_id, sequence, type, payload, created_at)
         SELECT ?1, ?2, ?3,
                COALESCE((SELECT MAX(sequence) FROM session_events WHERE session_id = ?2), -1) + 1,
                ?4, ?5, ?6",
        rusqlite::params![
            id.as_str(),
            session_id.as_str(),
            run_id.map(|r| r.as_str()),
            event_type,
            serde_json::to_string(&payload)?,
            now,
        ],
    )?;

    let sequence: i64 = conn.query_row(
        "SELECT sequence FROM session_events WHERE id = ?1",
        [id.as_str()],
        |row| row.get(0),
    )?;

    Ok(EventLogRow {
        id,
        session_id: session_id.clone(),
        run_id: run_id.cloned(),
        sequence,
        event_type: event_type.to_string(),
        payload,
        created_at: now,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventLogRow, StoreError> {
    let payload_str: String = row_helpers::get(row, 5, "session_events", "payload")?;
    let payload = row_helpers::parse_json(&payload_str, "session_events", "payload")?;

    Ok(EventLogRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "session_events", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "session_events",
            "session_id",
        )?),
        run_id: row_helpers::get_opt::<String>(row, 2, "session_events", "run_id")?
            .map(RunId::from_raw),
        sequence: row_helpers::get(row, 3, "session_events", "sequence")?,
        event_type: row_helpers::get(row, 4, "session_events", "type")?,
        payload,
        created_at: row_helpers::get(row, 6, "session_events", "created_at")?,
    })
}
