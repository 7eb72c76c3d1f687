use std::marker::PhantomData;

use rusqlite::{params_from_iter, OptionalExtension};

use crate::database::DbPool;
use crate::entity::Entity;
use crate::error::CutoverError;

/// CRUD access to one entity table on one backend.
///
/// Cloning is cheap: clones share the underlying connection pool.
pub struct EntityStore<T: Entity> {
    pool: DbPool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    pub fn create(&self, entity: &T) -> Result<(), CutoverError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::TABLE,
            T::select_list(),
            placeholders(T::COLUMNS.len())
        );
        conn.execute(&sql, params_from_iter(entity.values()))?;
        Ok(())
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<T>, CutoverError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM {} WHERE id = ?", T::select_list(), T::TABLE);
        let found = conn.query_row(&sql, [id], |row| T::from_row(row)).optional()?;
        Ok(found)
    }

    /// The row at position `offset` in id order, optionally restricted to rows
    /// updated strictly after `update_after` (epoch ms)
    pub fn find_nth_updated_after(
        &self,
        update_after: Option<i64>,
        offset: i64,
    ) -> Result<Option<T>, CutoverError> {
        let conn = self.pool.get()?;
        let found = match update_after {
            Some(watermark) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} > ? ORDER BY id LIMIT 1 OFFSET ?",
                    T::select_list(),
                    T::TABLE,
                    T::UPDATED_AT
                );
                conn.query_row(&sql, [watermark, offset], |row| T::from_row(row))
                    .optional()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM {} ORDER BY id LIMIT 1 OFFSET ?",
                    T::select_list(),
                    T::TABLE
                );
                conn.query_row(&sql, [offset], |row| T::from_row(row))
                    .optional()?
            }
        };
        Ok(found)
    }

    /// One page of ids in ascending order
    pub fn find_ids(&self, offset: i64, limit: i64) -> Result<Vec<i64>, CutoverError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT id FROM {} ORDER BY id LIMIT ? OFFSET ?", T::TABLE);
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([limit, offset], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// The subset of `ids` present in this table
    pub fn find_existing_ids(&self, ids: &[i64]) -> Result<Vec<i64>, CutoverError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT id FROM {} WHERE id IN ({}) ORDER BY id",
            T::TABLE,
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(ids.iter()), |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(found)
    }

    /// Insert the row, or overwrite `update_columns` if a row with the same id exists
    pub fn upsert(&self, entity: &T, update_columns: &[String]) -> Result<(), CutoverError> {
        let conn = self.pool.get()?;

        let conflict_action = if update_columns.is_empty() {
            "NOTHING".to_owned()
        } else {
            let assignments = update_columns
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("UPDATE SET {}", assignments)
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO {}",
            T::TABLE,
            T::select_list(),
            placeholders(T::COLUMNS.len()),
            conflict_action
        );
        conn.execute(&sql, params_from_iter(entity.values()))?;
        Ok(())
    }

    pub fn delete_by_id(&self, id: i64) -> Result<usize, CutoverError> {
        let conn = self.pool.get()?;
        let sql = format!("DELETE FROM {} WHERE id = ?", T::TABLE);
        Ok(conn.execute(&sql, [id])?)
    }

    pub fn count(&self) -> Result<i64, CutoverError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT count(*) FROM {}", T::TABLE);
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Column names of the table as the backend reports them
    pub fn table_columns(&self) -> Result<Vec<String>, CutoverError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?) ORDER BY cid")?;
        let columns = stmt
            .query_map([T::TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(CutoverError::Error(format!(
                "Table '{}' does not exist",
                T::TABLE
            )));
        }

        Ok(columns)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
