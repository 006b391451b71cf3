//! SQLite state store for worm positions and scanned-block checkpoints.
//!
//! Data model:
//!   positions       (id AUTOINCREMENT, blck, tx_hash, x, y, direction, price, ts)
//!   blocks_checked  (blck PRIMARY KEY)  append-only checkpoint ledger
//!
//! rusqlite is synchronous, so every call runs on the blocking pool behind a
//! single mutex-guarded connection. The pipeline coordinator is the only
//! writer; the cache and HTTP handlers only read.

use crate::position::Position;
use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Most recent records left out of `fetch_sample`.
pub const SAMPLE_EXCLUDE_RECENT: i64 = 100;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The block is already in the checkpoint ledger.
    #[error("checkpoint {0} already recorded")]
    DuplicateCheckpoint(u64),
    #[error("sqlite error: {0}")]
    Sqlite(String),
    #[error("store task failed: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage contract used by the coordinator, cache and read surface.
#[async_trait]
pub trait Store: Send + Sync {
    /// Most recently persisted position, or the origin when empty.
    async fn latest_position(&self) -> StoreResult<Position>;

    /// Highest checkpointed block, 0 when none.
    async fn latest_checkpoint(&self) -> StoreResult<u64>;

    /// Persist a position and return its assigned id.
    async fn save_position(&self, position: &Position) -> StoreResult<i64>;

    /// Append a block to the checkpoint ledger.
    ///
    /// Fails with `StoreError::DuplicateCheckpoint` if it is already there.
    async fn save_checkpoint(&self, block: u64) -> StoreResult<()>;

    /// Positions with id greater than `after_id`, ascending, at most `limit`.
    async fn fetch_positions(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Position>>;

    /// About `count` evenly spaced positions, excluding the most recent 100,
    /// ascending by id.
    async fn fetch_sample(&self, count: usize) -> StoreResult<Vec<Position>>;
}

/// `Store` backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) an on-disk database.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        info!(path = %db_path.as_ref().display(), "opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the schema. With `clean_slate` all existing data is dropped first.
    pub fn initialize(&self, clean_slate: bool) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        if clean_slate {
            info!("clean slate requested, dropping existing tables");
            conn.execute_batch(
                "DROP TABLE IF EXISTS positions;
                 DROP TABLE IF EXISTS blocks_checked;",
            )?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                blck      INTEGER NOT NULL,
                tx_hash   TEXT NOT NULL,
                x         REAL NOT NULL,
                y         REAL NOT NULL,
                direction REAL NOT NULL,
                price     REAL NOT NULL,
                ts        INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS blocks_checked (
                blck INTEGER PRIMARY KEY
            );",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

const POSITION_COLUMNS: &str = "id, blck, tx_hash, x, y, direction, price, ts";

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let ts: i64 = row.get(7)?;
    let timestamp = DateTime::from_timestamp(ts, 0).ok_or(
        rusqlite::Error::IntegralValueOutOfRange(7, ts),
    )?;
    Ok(Position {
        id: row.get(0)?,
        block: row.get(1)?,
        tx_hash: row.get(2)?,
        x: row.get(3)?,
        y: row.get(4)?,
        direction: row.get(5)?,
        price: row.get(6)?,
        timestamp,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

/// Step between sampled ids so that at most `count` fall in `min..=cutoff`.
fn sample_step(min_id: i64, cutoff: i64, count: usize) -> i64 {
    let span = cutoff - min_id + 1;
    let count = (count as i64).max(1);
    ((span + count - 1) / count).max(1)
}

#[async_trait]
impl Store for SqliteStore {
    async fn latest_position(&self) -> StoreResult<Position> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {POSITION_COLUMNS} FROM positions ORDER BY id DESC LIMIT 1"
            );
            let position = conn
                .query_row(&sql, [], row_to_position)
                .optional()?
                .unwrap_or_default();
            Ok(position)
        })
        .await
    }

    async fn latest_checkpoint(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let block: i64 = conn.query_row(
                "SELECT COALESCE(MAX(blck), 0) FROM blocks_checked",
                [],
                |row| row.get(0),
            )?;
            u64::try_from(block).map_err(|_| StoreError::Corrupt(format!("checkpoint {block}")))
        })
        .await
    }

    async fn save_position(&self, position: &Position) -> StoreResult<i64> {
        let p = position.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO positions (blck, tx_hash, x, y, direction, price, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.block,
                    p.tx_hash,
                    p.x,
                    p.y,
                    p.direction,
                    p.price,
                    p.timestamp.timestamp()
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id = id, block = p.block, "saved position");
            Ok(id)
        })
        .await
    }

    async fn save_checkpoint(&self, block: u64) -> StoreResult<()> {
        self.with_conn(move |conn| {
            match conn.execute("INSERT INTO blocks_checked (blck) VALUES (?1)", params![block]) {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateCheckpoint(block)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn fetch_positions(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Position>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {POSITION_COLUMNS} FROM positions WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![after_id, limit as i64], row_to_position)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn fetch_sample(&self, count: usize) -> StoreResult<Vec<Position>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let (min_id, max_id): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(id), MAX(id) FROM positions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (Some(min_id), Some(max_id)) = (min_id, max_id) else {
                return Ok(Vec::new());
            };
            let cutoff = max_id - SAMPLE_EXCLUDE_RECENT;
            if cutoff < min_id {
                return Ok(Vec::new());
            }

            let step = sample_step(min_id, cutoff, count);
            let sql = format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE id >= ?1 AND id <= ?2 AND (id - ?1) % ?3 = 0
                 ORDER BY id ASC LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![min_id, cutoff, step, count as i64],
                row_to_position,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize(false).unwrap();
        store
    }

    fn position(block: u64, x: f64) -> Position {
        Position {
            block,
            tx_hash: format!("0x{block:02x}"),
            x,
            y: -x,
            direction: 45.0,
            price: 1.5,
            timestamp: DateTime::from_timestamp(1_700_000_000 + block as i64, 0).unwrap(),
            ..Position::origin()
        }
    }

    async fn fill(store: &SqliteStore, n: u64) {
        for i in 1..=n {
            store.save_position(&position(i, i as f64)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_store_defaults() {
        let store = store();
        assert_eq!(store.latest_position().await.unwrap(), Position::origin());
        assert_eq!(store.latest_checkpoint().await.unwrap(), 0);
        assert!(store.fetch_positions(0, 10).await.unwrap().is_empty());
        assert!(store.fetch_sample(400).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_read_positions() {
        let store = store();
        let first = store.save_position(&position(10, 1.0)).await.unwrap();
        let second = store.save_position(&position(11, 2.0)).await.unwrap();
        assert!(second > first);

        let latest = store.latest_position().await.unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.block, 11);
        assert_eq!(latest.tx_hash, "0x0b");
        assert_eq!(latest.y, -2.0);
        assert_eq!(latest.timestamp.timestamp(), 1_700_000_011);

        let after = store.fetch_positions(first, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, second);
    }

    #[tokio::test]
    async fn test_fetch_positions_limit_and_order() {
        let store = store();
        fill(&store, 20).await;

        let page = store.fetch_positions(5, 4).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_duplicate_checkpoint_is_distinguished() {
        let store = store();
        store.save_checkpoint(50).await.unwrap();
        store.save_checkpoint(100).await.unwrap();

        let err = store.save_checkpoint(50).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCheckpoint(50)));
        assert_eq!(store.latest_checkpoint().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_fetch_sample_excludes_recent() {
        let store = store();
        fill(&store, 900).await;

        let sample = store.fetch_sample(400).await.unwrap();
        assert!(!sample.is_empty());
        assert!(sample.len() <= 400);
        assert!(sample.iter().all(|p| p.id <= 800));
        assert!(sample.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(sample[0].id, 1);
        // 800 eligible ids at step 2
        assert_eq!(sample.len(), 400);
    }

    #[tokio::test]
    async fn test_fetch_sample_small_store() {
        let store = store();
        fill(&store, 100).await;
        assert!(store.fetch_sample(400).await.unwrap().is_empty());

        store.save_position(&position(101, 0.0)).await.unwrap();
        let sample = store.fetch_sample(400).await.unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].id, 1);
    }

    #[tokio::test]
    async fn test_clean_slate_drops_data() {
        let store = store();
        fill(&store, 3).await;
        store.save_checkpoint(7).await.unwrap();

        store.initialize(false).unwrap();
        assert_eq!(store.latest_position().await.unwrap().id, 3);

        store.initialize(true).unwrap();
        assert_eq!(store.latest_position().await.unwrap().id, 0);
        assert_eq!(store.latest_checkpoint().await.unwrap(), 0);
    }

    #[test]
    fn test_sample_step() {
        assert_eq!(sample_step(1, 800, 400), 2);
        assert_eq!(sample_step(1, 10, 400), 1);
        assert_eq!(sample_step(1, 801, 400), 3);
    }
}
