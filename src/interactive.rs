use log::debug;
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{CutoverError, OptionalResult};
use crate::pool::{DoubleWritePool, TxBehavior};

/// Per-resource interaction counters, the reference migrated table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interactive {
    pub id: i64,
    pub biz: String,
    pub biz_id: i64,
    pub read_cnt: i64,
    pub like_cnt: i64,
    pub collect_cnt: i64,
    pub ctime: i64,
    pub utime: i64,
}

impl Entity for Interactive {
    const TABLE: &'static str = "interactives";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "biz",
        "biz_id",
        "read_cnt",
        "like_cnt",
        "collect_cnt",
        "ctime",
        "utime",
    ];
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS interactives (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            biz TEXT NOT NULL,
            biz_id INTEGER NOT NULL,
            read_cnt INTEGER NOT NULL DEFAULT 0,
            like_cnt INTEGER NOT NULL DEFAULT 0,
            collect_cnt INTEGER NOT NULL DEFAULT 0,
            ctime INTEGER NOT NULL,
            utime INTEGER NOT NULL,
            UNIQUE (biz, biz_id)
        );
        CREATE INDEX IF NOT EXISTS idx_interactives_utime ON interactives (utime);";

    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self == other
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Interactive {
            id: row.get(0)?,
            biz: row.get(1)?,
            biz_id: row.get(2)?,
            read_cnt: row.get(3)?,
            like_cnt: row.get(4)?,
            collect_cnt: row.get(5)?,
            ctime: row.get(6)?,
            utime: row.get(7)?,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Text(self.biz.clone()),
            Value::Integer(self.biz_id),
            Value::Integer(self.read_cnt),
            Value::Integer(self.like_cnt),
            Value::Integer(self.collect_cnt),
            Value::Integer(self.ctime),
            Value::Integer(self.utime),
        ]
    }
}

/// Application-side access to `interactives`, writing through the dual-write pool
pub struct InteractiveDao<'a> {
    pool: &'a DoubleWritePool,
}

impl<'a> InteractiveDao<'a> {
    pub fn new(pool: &'a DoubleWritePool) -> Self {
        Self { pool }
    }

    pub fn incr_read_cnt(&self, biz: &str, biz_id: i64) -> Result<(), CutoverError> {
        self.incr_counter("read_cnt", biz, biz_id, 1)
    }

    pub fn incr_like(&self, biz: &str, biz_id: i64) -> Result<(), CutoverError> {
        self.incr_counter("like_cnt", biz, biz_id, 1)
    }

    pub fn decr_like(&self, biz: &str, biz_id: i64) -> Result<(), CutoverError> {
        self.incr_counter("like_cnt", biz, biz_id, -1)
    }

    pub fn incr_collect(&self, biz: &str, biz_id: i64) -> Result<(), CutoverError> {
        self.incr_counter("collect_cnt", biz, biz_id, 1)
    }

    /// Insert-or-increment inside one transaction so both backends see the same statement
    /// sequence. The id is read back from the authoritative side and written explicitly,
    /// keeping ids identical across backends.
    fn incr_counter(
        &self,
        column: &'static str,
        biz: &str,
        biz_id: i64,
        delta: i64,
    ) -> Result<(), CutoverError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin_tx(TxBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM interactives WHERE biz = ? AND biz_id = ?",
                &[&biz, &biz_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                let sql = format!(
                    "UPDATE interactives SET {col} = MAX({col} + ?, 0), utime = ? WHERE id = ?",
                    col = column
                );
                tx.exec(&sql, &[&delta, &now, &id])?;
            }
            None => {
                let id: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM interactives",
                    &[],
                    |row| row.get(0),
                )?;
                let initial = delta.max(0);
                let sql = format!(
                    "INSERT INTO interactives (id, biz, biz_id, {col}, ctime, utime) VALUES (?, ?, ?, ?, ?, ?)",
                    col = column
                );
                tx.exec(&sql, &[&id, &biz, &biz_id, &initial, &now, &now])?;
            }
        }

        tx.commit()?;
        debug!("{} {:+} for {}:{}", column, delta, biz, biz_id);
        Ok(())
    }

    pub fn get(&self, biz: &str, biz_id: i64) -> Result<Option<Interactive>, CutoverError> {
        let sql = format!(
            "SELECT {} FROM interactives WHERE biz = ? AND biz_id = ?",
            Interactive::select_list()
        );
        let found = self
            .pool
            .query_row(&sql, &[&biz, &biz_id], Interactive::from_row)
            .optional()?;
        Ok(found)
    }
}
