use std::path::Path;
use std::time::Duration;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::BackendConfig;
use crate::entity::Entity;
use crate::error::CutoverError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

pub struct Database;

impl Database {
    /// Open a connection pool for one backend
    pub fn open_pool(config: &BackendConfig) -> Result<DbPool, CutoverError> {
        let path = Path::new(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(CutoverError::Error(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    parent.display()
                )));
            }
        }

        let busy_timeout_ms = config.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)?;

        info!(
            "Opened backend pool at {} (max {} connections)",
            path.display(),
            config.pool_size
        );

        Ok(pool)
    }

    /// Create the entity's table if it is not there yet
    pub fn ensure_schema<T: Entity>(pool: &DbPool) -> Result<(), CutoverError> {
        let conn = pool.get()?;
        conn.execute_batch(T::SCHEMA)?;
        Ok(())
    }
}
