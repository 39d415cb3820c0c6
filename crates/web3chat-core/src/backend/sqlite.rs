//! `SQLite` backend.
//!
//! One `rusqlite::Connection` behind a mutex; every statement runs on the
//! blocking thread pool so async callers never stall the runtime. Insert
//! notifications are fanned out in-process on the blocking thread, right
//! after the row is committed and while the connection is still held, so a
//! caller that stops waiting cannot separate the two.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::{
    now_ms, AuthBackend, EnvelopeBackend, InsertHandler, ListenerRegistry, Unsubscribe,
};
use crate::envelope::{Envelope, EnvelopeField, EnvelopeRecord};
use crate::error::{AuthError, BackendError};
use crate::identity::Identity;

/// Bump when [`SCHEMA`] changes.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS envelopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_envelopes_sender
    ON envelopes(sender_id, timestamp);

CREATE INDEX IF NOT EXISTS idx_envelopes_recipient
    ON envelopes(recipient_id, timestamp);

CREATE TABLE IF NOT EXISTS principals (
    principal TEXT PRIMARY KEY,
    credential_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    principal TEXT NOT NULL REFERENCES principals(principal) ON DELETE CASCADE,
    issued_at INTEGER NOT NULL
);
";

const ENVELOPE_COLUMNS: &str = "id, sender_id, recipient_id, message, timestamp, read";

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    listeners: ListenerRegistry,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current != SCHEMA_VERSION {
            if current != 0 {
                tracing::warn!(
                    old = current,
                    new = SCHEMA_VERSION,
                    "schema version mismatch, recreating database"
                );
                conn.execute_batch(
                    "DROP TABLE IF EXISTS sessions; \
                     DROP TABLE IF EXISTS principals; \
                     DROP TABLE IF EXISTS envelopes;",
                )?;
            }
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            listeners: ListenerRegistry::new(),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<tokio::task::JoinError> + Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock())).await?
    }

    /// Revoke every issued token.
    pub async fn expire_sessions(&self) -> Result<(), BackendError> {
        self.call(|conn| {
            conn.execute("DELETE FROM sessions", [])?;
            Ok::<_, BackendError>(())
        })
        .await
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

fn authorise(conn: &Connection, token: &str) -> Result<Identity, BackendError> {
    conn.query_row(
        "SELECT principal FROM sessions WHERE token = ?",
        params![token],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(Identity::from)
    .ok_or(BackendError::StaleSession)
}

fn row_to_envelope(row: &rusqlite::Row<'_>) -> Result<Envelope, rusqlite::Error> {
    let id: i64 = row.get(0)?;
    let timestamp: i64 = row.get(4)?;
    Ok(Envelope {
        id: id.to_string(),
        sender_id: Identity::from(row.get::<_, String>(1)?),
        recipient_id: Identity::from(row.get::<_, String>(2)?),
        ciphertext: row.get(3)?,
        created_at: u64::try_from(timestamp).unwrap_or(0),
        read: row.get(5)?,
    })
}

fn load(conn: &Connection, id: &str) -> Result<Option<Envelope>, BackendError> {
    let Ok(rowid) = id.parse::<i64>() else {
        return Ok(None);
    };
    Ok(conn
        .query_row(
            &format!("SELECT {ENVELOPE_COLUMNS} FROM envelopes WHERE id = ?"),
            params![rowid],
            row_to_envelope,
        )
        .optional()?)
}

fn credential_hash(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

fn to_sql_time(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[async_trait]
impl EnvelopeBackend for SqliteBackend {
    async fn insert(&self, token: &str, record: EnvelopeRecord) -> Result<String, BackendError> {
        let token = token.to_string();
        let listeners = self.listeners.clone();
        let id = self
            .call(move |conn| {
                authorise(conn, &token)?;
                conn.execute(
                    "INSERT INTO envelopes (sender_id, recipient_id, message, timestamp, read) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        record.sender_id.as_str(),
                        record.recipient_id.as_str(),
                        record.message,
                        to_sql_time(record.timestamp),
                        record.read
                    ],
                )?;
                let envelope = Envelope::from_record(conn.last_insert_rowid().to_string(), record);
                tracing::trace!(id = %envelope.id, "envelope row inserted");
                listeners.notify(&envelope);
                Ok::<_, BackendError>(envelope.id)
            })
            .await?;
        Ok(id)
    }

    async fn query_by_either_field(
        &self,
        token: &str,
        field1: EnvelopeField,
        field2: EnvelopeField,
        value: &Identity,
    ) -> Result<Vec<Envelope>, BackendError> {
        let token = token.to_string();
        let value = value.clone();
        self.call(move |conn| {
            authorise(conn, &token)?;
            let sql = format!(
                "SELECT {ENVELOPE_COLUMNS} FROM envelopes \
                 WHERE {} = ?1 OR {} = ?1 \
                 ORDER BY timestamp ASC, id ASC",
                field1.column(),
                field2.column()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![value.as_str()], row_to_envelope)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, BackendError>(rows)
        })
        .await
    }

    async fn get(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError> {
        let token = token.to_string();
        let id = id.to_string();
        self.call(move |conn| {
            authorise(conn, &token)?;
            load(conn, &id)
        })
        .await
    }

    async fn set_read(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError> {
        let token = token.to_string();
        let id = id.to_string();
        self.call(move |conn| {
            authorise(conn, &token)?;
            let Ok(rowid) = id.parse::<i64>() else {
                return Ok(None);
            };
            conn.execute("UPDATE envelopes SET read = 1 WHERE id = ?", params![rowid])?;
            load(conn, &id)
        })
        .await
    }

    async fn latest_timestamp(&self, token: &str) -> Result<Option<u64>, BackendError> {
        let token = token.to_string();
        self.call(move |conn| {
            authorise(conn, &token)?;
            let latest: Option<i64> =
                conn.query_row("SELECT MAX(timestamp) FROM envelopes", [], |row| row.get(0))?;
            Ok::<_, BackendError>(latest.and_then(|ms| u64::try_from(ms).ok()))
        })
        .await
    }

    fn on_insert(
        &self,
        field: EnvelopeField,
        value: &Identity,
        handler: InsertHandler,
    ) -> Unsubscribe {
        self.listeners.register(field, value.clone(), handler)
    }
}

#[async_trait]
impl AuthBackend for SqliteBackend {
    async fn sign_in(&self, principal: &Identity, credential: &str) -> Result<String, AuthError> {
        let principal = principal.clone();
        let hash = credential_hash(credential);
        self.call(move |conn| {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT credential_hash FROM principals WHERE principal = ?",
                    params![principal.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match stored {
                None => return Err(AuthError::UnknownPrincipal),
                Some(stored) if stored != hash => return Err(AuthError::InvalidCredential),
                Some(_) => {}
            }

            let mut raw = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            let token = hex::encode(raw);
            conn.execute(
                "INSERT INTO sessions (token, principal, issued_at) VALUES (?, ?, ?)",
                params![token, principal.as_str(), to_sql_time(now_ms())],
            )?;
            Ok::<_, AuthError>(token)
        })
        .await
    }

    async fn sign_up(&self, principal: &Identity, credential: &str) -> Result<(), AuthError> {
        let principal = principal.clone();
        let hash = credential_hash(credential);
        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO principals (principal, credential_hash, created_at) \
                 VALUES (?, ?, ?)",
                params![principal.as_str(), hash, to_sql_time(now_ms())],
            )?;
            if inserted == 0 {
                return Err(AuthError::AlreadyRegistered);
            }
            tracing::debug!(principal = %principal, "principal registered");
            Ok::<_, AuthError>(())
        })
        .await
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let token = token.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?", params![token])?;
            Ok::<_, AuthError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(from: &str, to: &str, ts: u64) -> EnvelopeRecord {
        EnvelopeRecord {
            sender_id: from.into(),
            recipient_id: to.into(),
            message: "c2VhbGVk".into(),
            timestamp: ts,
            read: false,
        }
    }

    async fn signed_in(backend: &SqliteBackend, who: &str) -> String {
        backend.sign_up(&who.into(), "pw").await.unwrap();
        backend.sign_in(&who.into(), "pw").await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_query_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let t = signed_in(&backend, "0xa").await;

        let first = backend.insert(&t, record("0xa", "0xb", 5)).await.unwrap();
        let second = backend.insert(&t, record("0xb", "0xa", 5)).await.unwrap();
        backend.insert(&t, record("0xc", "0xd", 1)).await.unwrap();

        let rows = backend
            .query_by_either_field(
                &t,
                EnvelopeField::SenderId,
                EnvelopeField::RecipientId,
                &"0xa".into(),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
        assert!(rows.iter().all(|e| !e.read));
    }

    #[tokio::test]
    async fn set_read_persists() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let t = signed_in(&backend, "0xa").await;
        let id = backend.insert(&t, record("0xa", "0xb", 1)).await.unwrap();

        assert!(backend.set_read(&t, &id).await.unwrap().unwrap().read);
        assert!(backend.get(&t, &id).await.unwrap().unwrap().read);
        assert!(backend.set_read(&t, "9999").await.unwrap().is_none());
        assert!(backend.get(&t, "not-a-rowid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auth_rules() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let a: Identity = "0xa".into();
        assert_eq!(
            backend.sign_in(&a, "pw").await.unwrap_err(),
            AuthError::UnknownPrincipal
        );
        backend.sign_up(&a, "pw").await.unwrap();
        assert_eq!(
            backend.sign_up(&a, "pw").await.unwrap_err(),
            AuthError::AlreadyRegistered
        );
        assert_eq!(
            backend.sign_in(&a, "other").await.unwrap_err(),
            AuthError::InvalidCredential
        );

        let token = backend.sign_in(&a, "pw").await.unwrap();
        backend.expire_sessions().await.unwrap();
        assert_eq!(
            backend.get(&token, "1").await.unwrap_err(),
            BackendError::StaleSession
        );
    }

    #[tokio::test]
    async fn latest_timestamp_reads_stored_maximum() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let t = signed_in(&backend, "0xa").await;
        assert_eq!(backend.latest_timestamp(&t).await.unwrap(), None);

        backend.insert(&t, record("0xa", "0xb", 40)).await.unwrap();
        backend.insert(&t, record("0xb", "0xa", 12)).await.unwrap();
        assert_eq!(backend.latest_timestamp(&t).await.unwrap(), Some(40));
        assert_eq!(
            backend.latest_timestamp("stale").await.unwrap_err(),
            BackendError::StaleSession
        );
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chat.db");
        let path = path.to_str().unwrap();

        let id = {
            let backend = SqliteBackend::open(path).unwrap();
            let t = signed_in(&backend, "0xa").await;
            backend.insert(&t, record("0xa", "0xb", 7)).await.unwrap()
        };

        let backend = SqliteBackend::open(path).unwrap();
        let t = backend.sign_in(&"0xa".into(), "pw").await.unwrap();
        let env = backend.get(&t, &id).await.unwrap().unwrap();
        assert_eq!(env.created_at, 7);
        assert_eq!(env.recipient_id.as_str(), "0xb");
    }
}
