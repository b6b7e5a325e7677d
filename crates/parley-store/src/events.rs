use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use parley_core::ids::{EventId, SessionId, UserId};
use parley_core::messages::{ChatMessage, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored event row. `session_id` and `sequence` are bookkeeping and
/// stay out of the wire shape.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: EventId,
    #[serde(skip_serializing)]
    pub session_id: SessionId,
    #[serde(skip_serializing)]
    pub sequence: i64,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// The newest event of a session, projected for list previews.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPreview {
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event to a session. Runs entirely inside one connection
    /// lock:
    /// 1. Verifies the session exists
    /// 2. Reads the last sequence and timestamp
    /// 3. Inserts with sequence + 1 and a created_at clamped so it never
    ///    sits before the previous event's
    ///
    /// Never bumps the session's `updated_at`; that moves only via
    /// `SessionRepo::touch`.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role))]
    pub fn append(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<EventRow, StoreError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::EmptyContent);
        }

        self.db.with_conn(|conn| {
            // One probe validates the session and fetches the tail of its log.
            let (max_seq, prev_created): (i64, Option<String>) = conn
                .query_row(
                    "SELECT COALESCE((SELECT MAX(sequence) FROM events WHERE session_id = ?1), -1),
                            (SELECT created_at FROM events WHERE session_id = ?1
                             ORDER BY sequence DESC LIMIT 1)
                     FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|_| StoreError::NotFound(format!("session {session_id}")))?;

            let sequence = max_seq + 1;
            let mut created_at = Utc::now();
            if let Some(prev) = prev_created
                .as_deref()
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
            {
                // A clock step backwards must not reorder the log.
                if prev > created_at {
                    created_at = prev;
                }
            }
            let created_at = created_at.to_rfc3339();

            let event_id = EventId::new();
            conn.execute(
                "INSERT INTO events (id, session_id, sequence, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event_id.as_str(),
                    session_id.as_str(),
                    sequence,
                    role.as_str(),
                    content,
                    created_at,
                ],
            )?;

            Ok(EventRow {
                id: event_id,
                session_id: session_id.clone(),
                sequence,
                role,
                content: content.to_string(),
                created_at,
            })
        })
    }

    /// List every event of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_all(&self, session_id: &SessionId) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sequence, role, content, created_at
                 FROM events WHERE session_id = ?1
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// The tail window: at most `limit` most-recent events, returned oldest
    /// first so they read chronologically.
    #[instrument(skip(self), fields(session_id = %session_id, limit))]
    pub fn list_recent(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sequence, role, content, created_at FROM (
                     SELECT id, session_id, sequence, role, content, created_at
                     FROM events WHERE session_id = ?1
                     ORDER BY sequence DESC LIMIT ?2
                 ) ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
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
                "SELECT COUNT(*) FROM events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Delete every event of a session. Deleting an empty or unknown
    /// session is a no-op.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete_all(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM events WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Project the tail window of a session into chat messages, oldest
    /// first, ready to hand to a completion call.
    #[instrument(skip(self), fields(session_id = %session_id, window))]
    pub fn build_context(
        &self,
        session_id: &SessionId,
        window: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let events = self.list_recent(session_id, window)?;
        Ok(events
            .into_iter()
            .map(|e| ChatMessage::new(e.role, e.content))
            .collect())
    }

    /// The newest event of each of an owner's sessions, keyed by session id.
    /// Sessions with no events are simply absent.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn previews_for_owner(
        &self,
        owner_id: &UserId,
    ) -> Result<HashMap<String, EventPreview>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, role, content, created_at FROM (
                     SELECT e.session_id, e.role, e.content, e.created_at,
                            ROW_NUMBER() OVER (
                                PARTITION BY e.session_id ORDER BY e.sequence DESC
                            ) AS rn
                     FROM events e
                     JOIN sessions s ON s.id = e.session_id
                     WHERE s.owner_id = ?1
                 ) WHERE rn = 1",
            )?;
            let mut rows = stmt.query([owner_id.as_str()])?;
            let mut previews = HashMap::new();
            while let Some(row) = rows.next()? {
                let session_id: String = row_helpers::get(row, 0, "events", "session_id")?;
                let raw_role: String = row_helpers::get(row, 1, "events", "role")?;
                previews.insert(
                    session_id,
                    EventPreview {
                        role: row_helpers::parse_enum(&raw_role, "events", "role")?,
                        content: row_helpers::get(row, 2, "events", "content")?,
                        created_at: row_helpers::get(row, 3, "events", "created_at")?,
                    },
                );
            }
            Ok(previews)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let raw_role: String = row_helpers::get(row, 3, "events", "role")?;

    Ok(EventRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "events", "session_id")?),
        sequence: row_helpers::get(row, 2, "events", "sequence")?,
        role: row_helpers::parse_enum(&raw_role, "events", "role")?,
        content: row_helpers::get(row, 4, "events", "content")?,
        created_at: row_helpers::get(row, 5, "events", "created_at")?,
    })
}
