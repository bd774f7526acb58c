//! SQLite-backed identity store.
//!
//! Records are stored as JSON next to an indexed `revision` column; the
//! compare-and-swap in [`IdentityStore::update_record`] is a single
//! conditional `UPDATE`. Blocking SQLite calls run on the blocking pool.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::{IdentityError, IdentityResult};
use crate::store::{IdentityRecord, IdentityStore, JoinToken, RegistrationEntry};
use crate::subject::SubjectId;

pub struct SqliteIdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdentityStore {
    /// Open (and create if needed) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> IdentityResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening identity datastore");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Datastore(format!("cannot create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> IdentityResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> IdentityResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> IdentityResult<T>
    where
        F: FnOnce(&mut Connection) -> IdentityResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IdentityError::Datastore("connection lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| IdentityError::Datastore(format!("datastore task failed: {e}")))?
    }
}

fn init_schema(conn: &Connection) -> IdentityResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS identity_records (
            subject TEXT PRIMARY KEY,
            revision INTEGER NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS join_tokens (
            token TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registration_entries (
            entry_id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );
        "#,
    )
    .map_err(db_err)
}

fn db_err(err: rusqlite::Error) -> IdentityError {
    IdentityError::Datastore(err.to_string())
}

fn decode_record(body: String) -> IdentityResult<IdentityRecord> {
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn fetch_record(&self, subject: &SubjectId) -> IdentityResult<Option<IdentityRecord>> {
        let key = subject.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT body FROM identity_records WHERE subject = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(decode_record)
            .transpose()
        })
        .await
    }

    async fn create_record(&self, mut record: IdentityRecord) -> IdentityResult<IdentityRecord> {
        record.revision = 1;
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&record)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO identity_records (subject, revision, body) VALUES (?1, ?2, ?3)",
                    params![record.subject.to_string(), record.revision as i64, body],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(IdentityError::Conflict {
                    subject: record.subject.to_string(),
                });
            }
            Ok(record)
        })
        .await
    }

    async fn update_record(&self, mut record: IdentityRecord) -> IdentityResult<IdentityRecord> {
        self.with_conn(move |conn| {
            let expected = record.revision;
            record.revision = expected + 1;
            let body = serde_json::to_string(&record)?;
            let key = record.subject.to_string();

            let updated = conn
                .execute(
                    "UPDATE identity_records SET revision = ?1, body = ?2 WHERE subject = ?3 AND revision = ?4",
                    params![record.revision as i64, body, key, expected as i64],
                )
                .map_err(db_err)?;
            if updated == 1 {
                return Ok(record);
            }

            let exists = conn
                .query_row(
                    "SELECT 1 FROM identity_records WHERE subject = ?1",
                    params![key],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            if exists {
                Err(IdentityError::Conflict { subject: key })
            } else {
                Err(IdentityError::NotFound { subject: key })
            }
        })
        .await
    }

    async fn delete_record(&self, subject: &SubjectId) -> IdentityResult<()> {
        let key = subject.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM identity_records WHERE subject = ?1", params![key])
                .map_err(db_err)?;
            if deleted == 0 {
                return Err(IdentityError::NotFound { subject: key });
            }
            Ok(())
        })
        .await
    }

    async fn list_records(&self) -> IdentityResult<Vec<IdentityRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM identity_records ORDER BY subject")
                .map_err(db_err)?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            bodies.into_iter().map(decode_record).collect()
        })
        .await
    }

    async fn create_join_token(&self, token: JoinToken) -> IdentityResult<()> {
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO join_tokens (token, expires_at) VALUES (?1, ?2)",
                    params![token.token, token.expires_at as i64],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(IdentityError::Datastore("join token already exists".to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn take_join_token(&self, token: &str) -> IdentityResult<Option<JoinToken>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let expires_at = tx
                .query_row(
                    "SELECT expires_at FROM join_tokens WHERE token = ?1",
                    params![token],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(db_err)?;
            let taken = match expires_at {
                Some(expires_at) => {
                    tx.execute("DELETE FROM join_tokens WHERE token = ?1", params![token])
                        .map_err(db_err)?;
                    Some(JoinToken {
                        token,
                        expires_at: expires_at.max(0) as u64,
                    })
                }
                None => None,
            };
            tx.commit().map_err(db_err)?;
            Ok(taken)
        })
        .await
    }

    async fn put_registration_entry(&self, entry: RegistrationEntry) -> IdentityResult<()> {
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&entry)?;
            conn.execute(
                "INSERT INTO registration_entries (entry_id, body) VALUES (?1, ?2)
                 ON CONFLICT(entry_id) DO UPDATE SET body = excluded.body",
                params![entry.entry_id, body],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn fetch_registration_entry(
        &self,
        entry_id: &str,
    ) -> IdentityResult<Option<RegistrationEntry>> {
        let entry_id = entry_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT body FROM registration_entries WHERE entry_id = ?1",
                params![entry_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|body| serde_json::from_str(&body).map_err(IdentityError::from))
            .transpose()
        })
        .await
    }
}
