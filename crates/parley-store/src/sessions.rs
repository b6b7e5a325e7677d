use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use parley_core::ids::{SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored session row. `owner_id` never leaves the server, so it is
/// excluded from serialization.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: SessionId,
    #[serde(skip_serializing)]
    pub owner_id: UserId,
    pub agent_key: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session owned by `owner_id`.
    #[instrument(skip(self), fields(owner_id = %owner_id, agent_key))]
    pub fn create(
        &self,
        owner_id: &UserId,
        agent_key: &str,
        title: Option<&str>,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner_id, agent_key, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    owner_id.as_str(),
                    agent_key,
                    title,
                    now,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                owner_id: owner_id.clone(),
                agent_key: agent_key.to_string(),
                title: title.map(str::to_string),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a session, scoped to its owner. A session owned by someone else
    /// is reported exactly like a missing one, so existence never leaks.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId, owner_id: &UserId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, agent_key, title, created_at, updated_at
                 FROM sessions WHERE id = ?1 AND owner_id = ?2",
            )?;
            let mut rows = stmt.query([id.as_str(), owner_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List an owner's sessions, most recently updated first, optionally
    /// narrowed to one agent key.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn list_for_owner(
        &self,
        owner_id: &UserId,
        agent_key: Option<&str>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params) = match agent_key {
                Some(key) => (
                    "SELECT id, owner_id, agent_key, title, created_at, updated_at
                     FROM sessions WHERE owner_id = ?1 AND agent_key = ?2
                     ORDER BY updated_at DESC, created_at DESC",
                    vec![owner_id.as_str(), key],
                ),
                None => (
                    "SELECT id, owner_id, agent_key, title, created_at, updated_at
                     FROM sessions WHERE owner_id = ?1
                     ORDER BY updated_at DESC, created_at DESC",
                    vec![owner_id.as_str()],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Advance `updated_at`. Called once per completed reply cycle, never
    /// per event append.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn touch(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, session_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    /// Set the title only when none has been set yet. Returns whether the
    /// title was written. Leaves `updated_at` alone so a reply cycle still
    /// bumps it exactly once.
    #[instrument(skip(self, title), fields(session_id = %session_id))]
    pub fn set_title_if_unset(
        &self,
        session_id: &SessionId,
        title: &str,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2 AND title IS NULL",
                rusqlite::params![title, session_id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete a session and every one of its events. A session that is
    /// missing or owned by someone else reports not-found.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId, owner_id: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let owned: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1 AND owner_id = ?2",
                    [session_id.as_str(), owner_id.as_str()],
                    |row| row.get(0),
                )
                .ok();
            if owned.is_none() {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }

            conn.execute(
                "DELETE FROM events WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        owner_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "owner_id")?),
        agent_key: row_helpers::get(row, 2, "sessions", "agent_key")?,
        title: row_helpers::get_opt(row, 3, "sessions", "title")?,
        created_at: row_helpers::get(row, 4, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 5, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (Database, UserId) {
        let db = Database::in_memory().unwrap();
        (db, UserId::from_raw("user_alice"))
    }

    #[test]
    fn create_session() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.agent_key, "helper");
        assert!(session.title.is_none());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn create_session_with_title() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", Some("Trip planning")).unwrap();
        assert_eq!(session.title.as_deref(), Some("Trip planning"));
    }

    #[test]
    fn get_session_scoped_to_owner() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();

        let fetched = repo.get(&session.id, &owner).unwrap();
        assert_eq!(fetched.id, session.id);

        let stranger = UserId::from_raw("user_bob");
        let result = repo.get(&session.id, &stranger);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn get_nonexistent_fails() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"), &owner);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn foreign_and_missing_sessions_are_indistinguishable() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();

        let stranger = UserId::from_raw("user_bob");
        let foreign = repo.get(&session.id, &stranger).unwrap_err().to_string();

        repo.delete(&session.id, &owner).unwrap();
        let missing = repo.get(&session.id, &owner).unwrap_err().to_string();

        assert_eq!(foreign, missing);
    }

    #[test]
    fn list_is_scoped_and_ordered_by_update() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);

        let first = repo.create(&owner, "helper", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = repo.create(&owner, "debugger", None).unwrap();

        let stranger = UserId::from_raw("user_bob");
        repo.create(&stranger, "helper", None).unwrap();

        let listed = repo.list_for_owner(&owner, None).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        std::thread::sleep(Duration::from_millis(5));
        repo.touch(&first.id).unwrap();
        let listed = repo.list_for_owner(&owner, None).unwrap();
        assert_eq!(listed[0].id, first.id, "touched session moves to the front");
    }

    #[test]
    fn list_filters_by_agent_key() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        repo.create(&owner, "helper", None).unwrap();
        repo.create(&owner, "debugger", None).unwrap();
        repo.create(&owner, "helper", None).unwrap();

        let helpers = repo.list_for_owner(&owner, Some("helper")).unwrap();
        assert_eq!(helpers.len(), 2);
        assert!(helpers.iter().all(|s| s.agent_key == "helper"));

        let none = repo.list_for_owner(&owner, Some("reviewer")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn touch_advances_updated_at() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        repo.touch(&session.id).unwrap();

        let fetched = repo.get(&session.id, &owner).unwrap();
        assert!(fetched.updated_at > session.updated_at);
        assert_eq!(fetched.created_at, session.created_at);
    }

    #[test]
    fn touch_missing_session_fails() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        let result = repo.touch(&SessionId::from_raw("sess_gone"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn set_title_only_once() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();

        assert!(repo.set_title_if_unset(&session.id, "First question").unwrap());
        assert!(!repo.set_title_if_unset(&session.id, "Second question").unwrap());

        let fetched = repo.get(&session.id, &owner).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("First question"));
        // Titling is cosmetic; it must not look like activity.
        assert_eq!(fetched.updated_at, session.updated_at);
    }

    #[test]
    fn set_title_respects_explicit_title() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", Some("Chosen")).unwrap();
        assert!(!repo.set_title_if_unset(&session.id, "Derived").unwrap());
        let fetched = repo.get(&session.id, &owner).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Chosen"));
    }

    #[test]
    fn delete_requires_ownership() {
        let (db, owner) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&owner, "helper", None).unwrap();

        let stranger = UserId::from_raw("user_bob");
        let result = repo.delete(&session.id, &stranger);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(repo.get(&session.id, &owner).is_ok());

        repo.delete(&session.id, &owner).unwrap();
        assert!(repo.get(&session.id, &owner).is_err());
    }
}
