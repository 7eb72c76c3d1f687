mod shadow;
mod tx;

pub use tx::{DoubleWriteTx, TxBehavior, TxHandle};

use log::{info, warn};
use rusqlite::{Row, ToSql};

use crate::database::DbPool;
use crate::error::CutoverError;
use crate::pattern::{Backend, Pattern, PatternCell};

use shadow::Shadow;

/// Connection pool facade that routes every statement to one or both backends
/// according to the active [`Pattern`].
///
/// - Writes go to the authoritative backend first; its error fails the call.
///   Under a dual-write pattern the same statement is then replayed on the
///   shadow backend, whose failure is only logged.
/// - Reads are never fanned out: they go to the authoritative backend.
///
/// Every call reads the pattern once when it starts, so a pattern change
/// never splits a call across two routing modes.
pub struct DoubleWritePool {
    src: DbPool,
    dst: DbPool,
    pattern: PatternCell,
}

impl DoubleWritePool {
    pub fn new(src: DbPool, dst: DbPool, pattern: Pattern) -> Self {
        Self {
            src,
            dst,
            pattern: PatternCell::new(pattern),
        }
    }

    pub fn pattern(&self) -> Result<Pattern, CutoverError> {
        self.pattern.load()
    }

    /// Swap the routing mode for all subsequent calls
    pub fn change_pattern(&self, pattern: Pattern) {
        match self.pattern.store(pattern) {
            Ok(previous) => info!("Pattern changed from {} to {}", previous, pattern),
            Err(e) => warn!("Pattern changed to {} (previous value unreadable: {})", pattern, e),
        }
    }

    /// The physical pool behind one backend
    pub fn backend_pool(&self, backend: Backend) -> &DbPool {
        match backend {
            Backend::Source => &self.src,
            Backend::Target => &self.dst,
        }
    }

    pub fn exec(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, CutoverError> {
        let pattern = self.pattern()?;

        let affected = {
            let conn = self.backend_pool(pattern.authoritative()).get()?;
            conn.execute(sql, params)?
        };

        if let Some(backend) = pattern.shadow() {
            Shadow::new(self.backend_pool(backend), backend).exec(sql, params);
        }

        Ok(affected)
    }

    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<T, CutoverError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let pattern = self.pattern()?;
        let conn = self.backend_pool(pattern.authoritative()).get()?;
        Ok(conn.query_row(sql, params, f)?)
    }

    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<Vec<T>, CutoverError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let pattern = self.pattern()?;
        let conn = self.backend_pool(pattern.authoritative()).get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Open a transaction under the current pattern.
    ///
    /// The authoritative transaction opens first. If the shadow one then fails
    /// to open, the authoritative one is rolled back and the error returned.
    pub fn begin_tx(&self, behavior: TxBehavior) -> Result<DoubleWriteTx, CutoverError> {
        DoubleWriteTx::begin(&self.src, &self.dst, self.pattern()?, behavior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::interactive::Interactive;
    use crate::test_utils::TestBackends;
    use strum::IntoEnumIterator;

    const INSERT: &str = "INSERT INTO interactives (id, biz, biz_id, read_cnt, ctime, utime) VALUES (?, 'article', ?, ?, 1, 1)";

    fn insert(pool: &DoubleWritePool, id: i64) -> Result<usize, CutoverError> {
        pool.exec(INSERT, &[&id, &id, &1i64])
    }

    fn counts(backends: &TestBackends) -> (i64, i64) {
        (
            backends.src_store().count().unwrap(),
            backends.dst_store().count().unwrap(),
        )
    }

    #[test]
    fn test_exec_routing_per_pattern() {
        for pattern in Pattern::iter() {
            let backends = TestBackends::new();
            let pool = backends.double_write_pool(pattern);
            assert_eq!(insert(&pool, 1).unwrap(), 1);

            let expected = match pattern {
                Pattern::SrcOnly => (1, 0),
                Pattern::SrcFirst | Pattern::DstFirst => (1, 1),
                Pattern::DstOnly => (0, 1),
            };
            assert_eq!(counts(&backends), expected, "routing for {}", pattern);
        }
    }

    #[test]
    fn test_shadow_failure_is_swallowed() {
        let backends = TestBackends::without_target_table();
        let pool = backends.double_write_pool(Pattern::SrcFirst);

        assert_eq!(insert(&pool, 1).unwrap(), 1);
        assert_eq!(backends.src_store().count().unwrap(), 1);
    }

    #[test]
    fn test_primary_failure_propagates_and_short_circuits() {
        let backends = TestBackends::without_target_table();

        let pool = backends.double_write_pool(Pattern::DstFirst);
        assert!(insert(&pool, 1).is_err());
        // Shadow must not run once the authoritative side failed
        assert_eq!(backends.src_store().count().unwrap(), 0);

        let pool = backends.double_write_pool(Pattern::DstOnly);
        assert!(insert(&pool, 1).is_err());
    }

    #[test]
    fn test_reads_go_to_authoritative_backend() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcOnly);
        insert(&pool, 1).unwrap();

        let sql = format!("SELECT {} FROM interactives", Interactive::select_list());
        for pattern in Pattern::iter() {
            pool.change_pattern(pattern);
            let rows = pool.query(&sql, &[], Interactive::from_row).unwrap();
            let expected = usize::from(pattern.authoritative() == Backend::Source);
            assert_eq!(rows.len(), expected, "read routing for {}", pattern);
        }
    }

    #[test]
    fn test_change_pattern_applies_to_next_call() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcOnly);
        insert(&pool, 1).unwrap();

        pool.change_pattern(Pattern::DstOnly);
        assert_eq!(pool.pattern().unwrap(), Pattern::DstOnly);
        insert(&pool, 2).unwrap();

        assert_eq!(counts(&backends), (1, 1));
    }

    #[test]
    fn test_corrupt_pattern_is_an_error() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcOnly);
        pool.pattern.store_raw(42);

        assert!(matches!(insert(&pool, 1), Err(CutoverError::UnknownPattern(_))));
        assert_eq!(counts(&backends), (0, 0));
    }

    #[test]
    fn test_tx_commit_writes_both_sides() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::DstFirst);

        let mut tx = pool.begin_tx(TxBehavior::Immediate).unwrap();
        tx.exec(INSERT, &[&1i64, &1i64, &5i64]).unwrap();
        tx.exec(INSERT, &[&2i64, &2i64, &6i64]).unwrap();
        tx.commit().unwrap();

        assert_eq!(counts(&backends), (2, 2));
    }

    #[test]
    fn test_tx_rollback_discards_both_sides() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcFirst);

        let mut tx = pool.begin_tx(TxBehavior::Deferred).unwrap();
        tx.exec(INSERT, &[&1i64, &1i64, &5i64]).unwrap();
        tx.rollback().unwrap();

        assert_eq!(counts(&backends), (0, 0));
    }

    #[test]
    fn test_tx_dropped_without_commit_rolls_back() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcFirst);

        {
            let mut tx = pool.begin_tx(TxBehavior::Deferred).unwrap();
            tx.exec(INSERT, &[&1i64, &1i64, &5i64]).unwrap();
        }

        assert_eq!(counts(&backends), (0, 0));
    }

    #[test]
    fn test_tx_shadow_failure_does_not_block_commit() {
        let backends = TestBackends::without_target_table();
        let pool = backends.double_write_pool(Pattern::SrcFirst);

        let mut tx = pool.begin_tx(TxBehavior::Deferred).unwrap();
        tx.exec(INSERT, &[&1i64, &1i64, &5i64]).unwrap();
        tx.commit().unwrap();

        assert_eq!(backends.src_store().count().unwrap(), 1);
    }

    #[test]
    fn test_tx_primary_failure_propagates() {
        let backends = TestBackends::without_target_table();
        let pool = backends.double_write_pool(Pattern::DstFirst);

        let mut tx = pool.begin_tx(TxBehavior::Deferred).unwrap();
        assert!(tx.exec(INSERT, &[&1i64, &1i64, &5i64]).is_err());
        tx.rollback().unwrap();
        assert_eq!(backends.src_store().count().unwrap(), 0);
    }

    #[test]
    fn test_tx_shadow_begin_failure_rolls_back_primary() {
        let backends = TestBackends::single_connection();
        let pool = backends.double_write_pool(Pattern::SrcFirst);

        // Starve the shadow side of connections
        let held = backends.dst_pool().get().unwrap();
        let result = pool.begin_tx(TxBehavior::Immediate);
        assert!(matches!(result, Err(CutoverError::PoolError(_))));
        drop(held);

        // The primary connection is back in the pool with no open transaction
        let conn = backends.src_pool().get().unwrap();
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_tx_keeps_pattern_it_started_with() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::SrcOnly);

        let mut tx = pool.begin_tx(TxBehavior::Deferred).unwrap();
        pool.change_pattern(Pattern::SrcFirst);
        assert_eq!(tx.pattern(), Pattern::SrcOnly);
        tx.exec(INSERT, &[&1i64, &1i64, &5i64]).unwrap();
        tx.commit().unwrap();

        assert_eq!(counts(&backends), (1, 0));
    }

    #[test]
    fn test_tx_reads_see_own_writes() {
        let backends = TestBackends::new();
        let pool = backends.double_write_pool(Pattern::DstFirst);

        let mut tx = pool.begin_tx(TxBehavior::Immediate).unwrap();
        tx.exec(INSERT, &[&3i64, &3i64, &5i64]).unwrap();
        let read_cnt: i64 = tx
            .query_row("SELECT read_cnt FROM interactives WHERE id = ?", &[&3i64], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(read_cnt, 5);
        tx.commit().unwrap();
    }
}
