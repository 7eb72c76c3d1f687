//! Shared fixtures for unit tests: a pair of throwaway SQLite backends.

use tempfile::TempDir;

use crate::config::BackendConfig;
use crate::database::{Database, DbPool};
use crate::interactive::Interactive;
use crate::pattern::Pattern;
use crate::pool::DoubleWritePool;
use crate::store::EntityStore;

pub struct TestBackends {
    // Keeps the database files alive for the life of the fixture
    _dir: TempDir,
    src: DbPool,
    dst: DbPool,
}

impl TestBackends {
    pub fn new() -> Self {
        Self::build(4, true)
    }

    /// Target backend has no `interactives` table, so every statement against it fails
    pub fn without_target_table() -> Self {
        Self::build(4, false)
    }

    /// Each backend gets exactly one connection
    pub fn single_connection() -> Self {
        Self::build(1, true)
    }

    fn build(pool_size: u32, target_table: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let open = |name: &str| {
            Database::open_pool(&BackendConfig {
                path: dir.path().join(name).to_string_lossy().into_owned(),
                pool_size,
                connection_timeout_ms: 200,
                busy_timeout_ms: 1000,
            })
            .unwrap()
        };

        let src = open("src.db");
        let dst = open("dst.db");
        Database::ensure_schema::<Interactive>(&src).unwrap();
        if target_table {
            Database::ensure_schema::<Interactive>(&dst).unwrap();
        }

        Self { _dir: dir, src, dst }
    }

    pub fn src_pool(&self) -> DbPool {
        self.src.clone()
    }

    pub fn dst_pool(&self) -> DbPool {
        self.dst.clone()
    }

    pub fn src_store(&self) -> EntityStore<Interactive> {
        EntityStore::new(self.src.clone())
    }

    pub fn dst_store(&self) -> EntityStore<Interactive> {
        EntityStore::new(self.dst.clone())
    }

    pub fn double_write_pool(&self, pattern: Pattern) -> DoubleWritePool {
        DoubleWritePool::new(self.src.clone(), self.dst.clone(), pattern)
    }
}

pub fn interactive(id: i64, read_cnt: i64, utime: i64) -> Interactive {
    Interactive {
        id,
        biz: "article".to_owned(),
        biz_id: id,
        read_cnt,
        like_cnt: 0,
        collect_cnt: 0,
        ctime: 1,
        utime,
    }
}
