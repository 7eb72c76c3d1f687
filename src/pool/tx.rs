use log::warn;
use rusqlite::{Row, ToSql};

use crate::database::{DbConn, DbPool};
use crate::error::CutoverError;
use crate::pattern::{Backend, Pattern};

use super::shadow::Shadow;

/// Locking behavior requested when a transaction is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxBehavior {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TxBehavior {
    fn begin_sql(&self) -> &'static str {
        match self {
            TxBehavior::Deferred => "BEGIN DEFERRED",
            TxBehavior::Immediate => "BEGIN IMMEDIATE",
            TxBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// An open transaction on one backend.
///
/// Owns its pooled connection for the life of the transaction. Dropping a
/// handle that was neither committed nor rolled back rolls it back.
pub struct TxHandle {
    conn: DbConn,
    backend: Backend,
    finished: bool,
}

impl TxHandle {
    pub(crate) fn begin(
        pool: &DbPool,
        backend: Backend,
        behavior: TxBehavior,
    ) -> Result<Self, CutoverError> {
        let conn = pool.get()?;
        conn.execute_batch(behavior.begin_sql())?;
        Ok(Self {
            conn,
            backend,
            finished: false,
        })
    }

    pub fn exec(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, CutoverError> {
        Ok(self.conn.execute(sql, params)?)
    }

    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<T, CutoverError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f)?)
    }

    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<Vec<T>, CutoverError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn commit(mut self) -> Result<(), CutoverError> {
        // A failed COMMIT leaves `finished` unset so drop rolls back
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), CutoverError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        if self.finished || self.conn.is_autocommit() {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Rollback of abandoned transaction on {} failed: {}", self.backend, e);
        }
    }
}

/// A transaction spanning one or both backends, following the pattern that
/// was active when it began.
///
/// The authoritative side decides every outcome; the shadow side, present only
/// for dual-write patterns, is best-effort.
pub struct DoubleWriteTx {
    pattern: Pattern,
    primary: TxHandle,
    shadow: Option<Shadow<TxHandle>>,
}

impl DoubleWriteTx {
    pub(crate) fn begin(
        src: &DbPool,
        dst: &DbPool,
        pattern: Pattern,
        behavior: TxBehavior,
    ) -> Result<Self, CutoverError> {
        let pool_for = |backend: Backend| match backend {
            Backend::Source => src,
            Backend::Target => dst,
        };

        let primary_backend = pattern.authoritative();
        let primary = TxHandle::begin(pool_for(primary_backend), primary_backend, behavior)?;

        let shadow = match pattern.shadow() {
            Some(backend) => match TxHandle::begin(pool_for(backend), backend, behavior) {
                Ok(tx) => Some(Shadow::new(tx, backend)),
                Err(e) => {
                    // Never leave the authoritative side half-open
                    warn!(
                        "Failed to begin shadow transaction on {}: {}; rolling back {}",
                        backend, e, primary_backend
                    );
                    if let Err(rollback_err) = primary.rollback() {
                        warn!("Rollback on {} failed: {}", primary_backend, rollback_err);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Self {
            pattern,
            primary,
            shadow,
        })
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn exec(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, CutoverError> {
        let affected = self.primary.exec(sql, params)?;
        if let Some(shadow) = self.shadow.as_mut() {
            shadow.exec(sql, params);
        }
        Ok(affected)
    }

    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<T, CutoverError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.primary.query_row(sql, params, f)
    }

    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<Vec<T>, CutoverError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.primary.query(sql, params, f)
    }

    pub fn commit(self) -> Result<(), CutoverError> {
        let DoubleWriteTx { primary, shadow, .. } = self;
        primary.commit()?;
        if let Some(shadow) = shadow {
            shadow.commit();
        }
        Ok(())
    }

    pub fn rollback(self) -> Result<(), CutoverError> {
        let DoubleWriteTx { primary, shadow, .. } = self;
        primary.rollback()?;
        if let Some(shadow) = shadow {
            shadow.rollback();
        }
        Ok(())
    }
}
