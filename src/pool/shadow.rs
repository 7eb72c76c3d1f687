use log::warn;
use rusqlite::ToSql;

use crate::database::DbPool;
use crate::error::CutoverError;
use crate::pattern::Backend;

use super::tx::TxHandle;

/// Best-effort wrapper around the non-authoritative side of a dual write.
///
/// Every operation logs its failure and returns nothing, so the authoritative
/// path never observes shadow errors. Drift left behind is repaired by the
/// validator and fixer.
pub(crate) struct Shadow<H> {
    inner: H,
    backend: Backend,
}

impl<H> Shadow<H> {
    pub(crate) fn new(inner: H, backend: Backend) -> Self {
        Self { inner, backend }
    }
}

impl Shadow<&DbPool> {
    pub(crate) fn exec(&self, sql: &str, params: &[&dyn ToSql]) {
        let result = self
            .inner
            .get()
            .map_err(CutoverError::from)
            .and_then(|conn| Ok(conn.execute(sql, params)?));

        if let Err(e) = result {
            warn!("Shadow write to {} failed: {} (sql: {})", self.backend, e, sql);
        }
    }
}

impl Shadow<TxHandle> {
    pub(crate) fn exec(&mut self, sql: &str, params: &[&dyn ToSql]) {
        if let Err(e) = self.inner.exec(sql, params) {
            warn!(
                "Shadow transaction write to {} failed: {} (sql: {})",
                self.backend, e, sql
            );
        }
    }

    pub(crate) fn commit(self) {
        if let Err(e) = self.inner.commit() {
            warn!("Shadow commit on {} failed: {}", self.backend, e);
        }
    }

    pub(crate) fn rollback(self) {
        if let Err(e) = self.inner.rollback() {
            warn!("Shadow rollback on {} failed: {}", self.backend, e);
        }
    }
}
