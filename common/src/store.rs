//! SQLite event store.
//!
//! Append-only: rows are inserted once and never updated or deleted.  Each
//! operation opens its own connection, so the handle is cheap to clone and
//! safe to share across threads.  WAL journaling lets readers proceed while
//! a writer appends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::event::{CapturedEvent, EventId, EventSummary, IdGenerator, NewEvent};

const BUSY_TIMEOUT: Duration = Duration::from_secs(3);

/// Failure of the durable medium.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Handle to the `webhooks` table.
#[derive(Clone)]
pub struct EventStore {
    db_path: Arc<PathBuf>,
    ids: Arc<IdGenerator>,
}

impl EventStore {
    /// Create the schema if needed and seed the id generator with the
    /// newest stored id.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        initialize(db_path)?;
        let store = EventStore {
            db_path: Arc::new(db_path.to_path_buf()),
            ids: Arc::new(IdGenerator::new()),
        };

        if let Some(newest) = newest_id(&store.connect()?)? {
            store.ids.observe(&newest);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Store one delivery, assigning `id` and `created_at` when absent.
    ///
    /// The id is drawn inside an immediate (write-locked) transaction, so
    /// rows commit in id order even with concurrent writers: a reader never
    /// sees a row appear below an id it has already observed.
    pub fn insert(&self, event: NewEvent) -> Result<CapturedEvent, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Another process may have appended since this handle was opened.
        if let Some(newest) = newest_id(&tx)? {
            self.ids.observe(&newest);
        }
        let id = match event.id {
            Some(id) => {
                self.ids.observe(&id);
                id
            }
            None => self.ids.next_id(),
        };

        let headers: BTreeMap<String, String> = event
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let captured = CapturedEvent {
            id,
            method: event.method,
            path: event.path,
            source_ip: event.source_ip,
            status_code: event.status_code,
            content_type: event.content_type,
            content_length: event.content_length,
            query_params: event.query_params,
            headers,
            body: event.body,
            created_at: event.created_at.unwrap_or_else(Utc::now),
        };

        tx.execute(
            "INSERT INTO webhooks (id, method, path, source_ip, status_code, content_type, \
             content_length, query_params, headers, body, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                captured.id.to_string(),
                captured.method,
                captured.path,
                captured.source_ip,
                captured.status_code,
                captured.content_type,
                captured.content_length.map(|n| n as i64),
                to_json(&captured.query_params),
                to_json(&captured.headers),
                captured.body,
                captured.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        debug!("Stored event {} ({} {})", captured.id, captured.method, captured.path);
        Ok(captured)
    }

    /// Up to `limit` summaries in descending id order, restricted to ids
    /// strictly below `cursor` when one is given.
    pub fn range_before(
        &self,
        cursor: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<EventSummary>, StoreError> {
        let conn = self.connect()?;
        let limit = limit as i64;

        let rows = match cursor {
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    "SELECT id, method, path, created_at FROM webhooks \
                     WHERE id < ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![cursor.to_string(), limit], summary_columns)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, method, path, created_at FROM webhooks \
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], summary_columns)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        rows.into_iter()
            .map(|(id, method, path, created_at)| {
                Ok(EventSummary {
                    id: parse_id(&id)?,
                    method,
                    path,
                    created_at: parse_time(&id, &created_at)?,
                })
            })
            .collect()
    }

    /// Bodies of the given events in one batched read.  Unknown ids are
    /// skipped; result order is unspecified.
    pub fn bodies_for(&self, ids: &[EventId]) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT body FROM webhooks WHERE id IN ({placeholders})");

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let bodies = stmt
            .query_map(params_from_iter(keys.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bodies)
    }

    /// Full record for one id.
    pub fn get(&self, id: &EventId) -> Result<Option<CapturedEvent>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, method, path, source_ip, status_code, content_type, \
                 content_length, query_params, headers, body, created_at \
                 FROM webhooks WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(RawEvent {
                        id: row.get(0)?,
                        method: row.get(1)?,
                        path: row.get(2)?,
                        source_ip: row.get(3)?,
                        status_code: row.get(4)?,
                        content_type: row.get(5)?,
                        content_length: row.get(6)?,
                        query_params: row.get(7)?,
                        headers: row.get(8)?,
                        body: row.get(9)?,
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()?;

        row.map(RawEvent::decode).transpose()
    }

    /// Number of stored events.
    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM webhooks", [], |row| row.get(0))?;
        Ok(n as u64)
    }

}

fn newest_id(conn: &Connection) -> Result<Option<EventId>, StoreError> {
    let newest: Option<String> = conn
        .query_row("SELECT MAX(id) FROM webhooks", [], |row| row.get(0))
        .optional()?
        .flatten();
    newest.as_deref().map(parse_id).transpose()
}

/// Create the `webhooks` table (and index) if it doesn't exist.
fn initialize(db_path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS webhooks (
            id             TEXT PRIMARY KEY NOT NULL,
            method         TEXT NOT NULL,
            path           TEXT NOT NULL,
            source_ip      TEXT NOT NULL,
            status_code    INTEGER NOT NULL DEFAULT 200,
            content_type   TEXT,
            content_length INTEGER,
            query_params   TEXT NOT NULL DEFAULT '{}',
            headers        TEXT NOT NULL DEFAULT '{}',
            body           TEXT NOT NULL DEFAULT '',
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS webhooks_id_desc ON webhooks (id DESC);
    ",
    )?;

    info!("Event store ready at {}", db_path.display());
    Ok(())
}

type SummaryRow = (String, String, String, String);

fn summary_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

struct RawEvent {
    id: String,
    method: String,
    path: String,
    source_ip: String,
    status_code: u16,
    content_type: Option<String>,
    content_length: Option<i64>,
    query_params: String,
    headers: String,
    body: String,
    created_at: String,
}

impl RawEvent {
    fn decode(self) -> Result<CapturedEvent, StoreError> {
        Ok(CapturedEvent {
            id: parse_id(&self.id)?,
            created_at: parse_time(&self.id, &self.created_at)?,
            query_params: from_json(&self.id, &self.query_params)?,
            headers: from_json(&self.id, &self.headers)?,
            method: self.method,
            path: self.path,
            source_ip: self.source_ip,
            status_code: self.status_code,
            content_type: self.content_type,
            content_length: self.content_length.map(|n| n.max(0) as u64),
            body: self.body,
        })
    }
}

fn to_json(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".into())
}

fn from_json(id: &str, text: &str) -> Result<BTreeMap<String, String>, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn parse_id(text: &str) -> Result<EventId, StoreError> {
    text.parse().map_err(|_| StoreError::Corrupt {
        id: text.to_string(),
        reason: "id is not a UUID".into(),
    })
}

fn parse_time(id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("created_at {text:?}: {e}"),
        })
}

// ─── tests ───────────────────────────────────────────────────────────────
