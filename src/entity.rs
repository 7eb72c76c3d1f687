use std::fmt::Debug;

use rusqlite::types::Value;
use rusqlite::Row;

/// A row type that can be migrated between backends.
///
/// Both backends are expected to hold the same table with the same columns.
/// `COLUMNS` lists every column in select order and must start with `id`;
/// `values` returns the row's values in that same order.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Column holding the last-update time in epoch milliseconds
    const UPDATED_AT: &'static str = "utime";
    /// `CREATE TABLE IF NOT EXISTS` statement for the table
    const SCHEMA: &'static str;

    fn id(&self) -> i64;

    /// Full structural equality against the same conceptual row from the other backend
    fn compare_to(&self, other: &Self) -> bool;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn values(&self) -> Vec<Value>;

    /// Comma separated column list for SELECT statements
    fn select_list() -> String {
        Self::COLUMNS.join(", ")
    }
}
