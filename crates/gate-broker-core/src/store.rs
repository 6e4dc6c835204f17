//! Durable storage for queue entries and the audit log, backed by SQLite.
//!
//! The hot path (enqueue + grant) is written as a single transaction
//! together with its audit record, per §3/§9 of the spec: a grant is never
//! acknowledged to the in-memory queue until it is durable.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use gate_proto::{LockMode, OwnerToken, PathKey, RequestId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::audit::AuditRecord;
use crate::error::StoreError;
use crate::queue::{Entry, EntryState};

/// How many audit rows to retain before the oldest are trimmed. Rotation
/// policy is implementation-defined per §3; this caps unbounded growth
/// without needing a separate rotation task.
const AUDIT_ROW_CAP: i64 = 100_000;

/// One upsert against `queue_entries`: the full persisted shape of an
/// in-memory [`Entry`], keyed by `(path, owner)`.
#[derive(Debug, Clone)]
pub struct EntryUpsert {
    pub path: PathKey,
    pub entry: Entry,
}

/// The SQLite-backed durable store for one broker instance.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the database at `db_path` and ensure the
    /// schema exists.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::StateDir(format!("{}: {e}", parent.display())))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// In-memory store for tests that don't need a real file.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                path TEXT NOT NULL,
                owner TEXT NOT NULL,
                mode TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                state TEXT NOT NULL,
                hold_count INTEGER NOT NULL,
                granted_at TEXT,
                last_heartbeat TEXT,
                PRIMARY KEY (path, owner)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event TEXT NOT NULL,
                path TEXT NOT NULL,
                owner TEXT NOT NULL,
                mode TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Apply a batch of upserts and removals, plus their audit records, as
    /// one transaction. Used after every `acquire`/`release`/`heartbeat`/
    /// sweep step that changed in-memory state.
    pub async fn apply(
        &self,
        upserts: &[EntryUpsert],
        removals: &[(PathKey, OwnerToken)],
        audit: &[AuditRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for u in upserts {
            let owner = u.entry.owner.to_string();
            let mode = mode_str(u.entry.mode);
            let state = state_str(u.entry.state);
            let enqueued_at = u.entry.enqueued_at.to_rfc3339();
            let granted_at = u.entry.granted_at.map(|t| t.to_rfc3339());
            let last_heartbeat = u.entry.last_heartbeat.map(|t| t.to_rfc3339());
            #[allow(clippy::cast_possible_wrap)]
            let request_id = u.entry.request_id.0 as i64;
            #[allow(clippy::cast_possible_wrap)]
            let hold_count = u.entry.hold_count as i64;

            sqlx::query(
                "INSERT INTO queue_entries
                    (path, owner, mode, request_id, enqueued_at, state, hold_count, granted_at, last_heartbeat)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(path, owner) DO UPDATE SET
                    mode = excluded.mode,
                    request_id = excluded.request_id,
                    state = excluded.state,
                    hold_count = excluded.hold_count,
                    granted_at = excluded.granted_at,
                    last_heartbeat = excluded.last_heartbeat",
            )
            .bind(&u.path)
            .bind(&owner)
            .bind(mode)
            .bind(request_id)
            .bind(&enqueued_at)
            .bind(state)
            .bind(hold_count)
            .bind(&granted_at)
            .bind(&last_heartbeat)
            .execute(&mut *tx)
            .await?;
        }

        for (path, owner) in removals {
            sqlx::query("DELETE FROM queue_entries WHERE path = ? AND owner = ?")
                .bind(path)
                .bind(owner.to_string())
                .execute(&mut *tx)
                .await?;
        }

        for rec in audit {
            sqlx::query(
                "INSERT INTO audit_log (timestamp, event, path, owner, mode) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(rec.timestamp.to_rfc3339())
            .bind(rec.event.as_str())
            .bind(&rec.path)
            .bind(rec.owner.to_string())
            .bind(mode_str(rec.mode))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Trim the audit log down to [`AUDIT_ROW_CAP`] rows, dropping the
    /// oldest first. Rotation policy is implementation-defined (§3); this
    /// implementation's choice is a simple row-count cap.
    pub async fn trim_audit_log(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM audit_log WHERE id NOT IN (
                SELECT id FROM audit_log ORDER BY id DESC LIMIT ?
            )",
        )
        .bind(AUDIT_ROW_CAP)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Load every persisted queue entry, grouped by path and ordered by
    /// `(enqueued_at, request_id)` within each path — the FIFO order
    /// [`crate::queue::PathQueue::from_entries`] expects.
    pub async fn load_all(&self) -> Result<HashMap<PathKey, Vec<Entry>>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, owner, mode, request_id, enqueued_at, state, hold_count, granted_at, last_heartbeat
             FROM queue_entries
             ORDER BY path, enqueued_at, request_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_path: HashMap<PathKey, Vec<Entry>> = HashMap::new();
        for row in rows {
            let path: PathKey = row.try_get("path")?;
            let owner_str: String = row.try_get("owner")?;
            let owner = owner_str
                .parse()
                .map(OwnerToken)
                .map_err(|_| StoreError::BadTimestamp { field: "owner", value: owner_str })?;
            let mode_str: String = row.try_get("mode")?;
            let mode = parse_mode(&mode_str)?;
            #[allow(clippy::cast_sign_loss)]
            let request_id = RequestId(row.try_get::<i64, _>("request_id")? as u64);
            let enqueued_at = parse_ts(row.try_get("enqueued_at")?, "enqueued_at")?;
            let state_str: String = row.try_get("state")?;
            let state = parse_state(&state_str)?;
            #[allow(clippy::cast_sign_loss)]
            let hold_count = row.try_get::<i64, _>("hold_count")? as u32;
            let granted_at = row
                .try_get::<Option<String>, _>("granted_at")?
                .map(|s| parse_ts(s, "granted_at"))
                .transpose()?;
            let last_heartbeat = row
                .try_get::<Option<String>, _>("last_heartbeat")?
                .map(|s| parse_ts(s, "last_heartbeat"))
                .transpose()?;

            by_path.entry(path).or_default().push(Entry {
                owner,
                mode,
                request_id,
                enqueued_at,
                state,
                hold_count,
                granted_at,
                last_heartbeat,
            });
        }
        Ok(by_path)
    }
}

fn mode_str(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Read => "read",
        LockMode::Write => "write",
    }
}

fn state_str(state: EntryState) -> &'static str {
    match state {
        EntryState::Waiting => "waiting",
        EntryState::Granted => "granted",
    }
}

fn parse_mode(s: &str) -> Result<LockMode, StoreError> {
    match s {
        "read" => Ok(LockMode::Read),
        "write" => Ok(LockMode::Write),
        other => Err(StoreError::BadTimestamp { field: "mode", value: other.to_string() }),
    }
}

fn parse_state(s: &str) -> Result<EntryState, StoreError> {
    match s {
        "waiting" => Ok(EntryState::Waiting),
        "granted" => Ok(EntryState::Granted),
        other => Err(StoreError::BadTimestamp { field: "state", value: other.to_string() }),
    }
}

fn parse_ts(s: String, field: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp { field, value: s })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Entry as QEntry;
    use gate_proto::OwnerToken;

    fn sample_entry(owner: OwnerToken, state: EntryState) -> QEntry {
        let now = Utc::now();
        QEntry {
            owner,
            mode: LockMode::Write,
            request_id: RequestId(1),
            enqueued_at: now,
            state,
            hold_count: 1,
            granted_at: if state == EntryState::Granted { Some(now) } else { None },
            last_heartbeat: if state == EntryState::Granted { Some(now) } else { None },
        }
    }

    #[tokio::test]
    async fn apply_then_load_round_trips_an_entry() {
        let store = Store::open_in_memory().await.unwrap();
        let owner = OwnerToken::new();
        let upsert = EntryUpsert {
            path: "/f".to_string(),
            entry: sample_entry(owner, EntryState::Granted),
        };
        store.apply(&[upsert], &[], &[]).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        let entries = loaded.get("/f").expect("path present");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner, owner);
        assert!(entries[0].is_granted());
    }

    #[tokio::test]
    async fn removal_deletes_the_row() {
        let store = Store::open_in_memory().await.unwrap();
        let owner = OwnerToken::new();
        let upsert = EntryUpsert {
            path: "/f".to_string(),
            entry: sample_entry(owner, EntryState::Granted),
        };
        store.apply(&[upsert], &[], &[]).await.unwrap();
        store.apply(&[], &[("/f".to_string(), owner)], &[]).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert!(loaded.get("/f").is_none_or(Vec::is_empty));
    }
}
