use log::{debug, Level};
use logging_timer::timer;

use crate::entity::Entity;
use crate::error::CutoverError;
use crate::events::InconsistentEvent;
use crate::store::EntityStore;

/// What a fix did to the target row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    /// Target row now matches base (inserted or overwritten)
    Upserted,
    /// Base has no such row; target row removed if it was there
    Deleted { removed: bool },
}

/// Repairs one row of `target` so that it matches `base`.
///
/// A fix is idempotent: it always converges the target row to the base row's
/// current state (or to absent), whatever drift kind was reported.
pub struct Fixer<T: Entity> {
    base: EntityStore<T>,
    target: EntityStore<T>,
    columns: Vec<String>,
}

impl<T: Entity> Fixer<T> {
    /// Build a fixer whose update columns come from the target table's shape
    pub fn new(base: EntityStore<T>, target: EntityStore<T>) -> Result<Self, CutoverError> {
        let columns = Self::introspect_columns(&target)?;
        Ok(Self::with_columns(base, target, columns))
    }

    /// Build a fixer that overwrites exactly `columns` on conflict
    pub fn with_columns(base: EntityStore<T>, target: EntityStore<T>, columns: Vec<String>) -> Self {
        Self {
            base,
            target,
            columns,
        }
    }

    fn introspect_columns(target: &EntityStore<T>) -> Result<Vec<String>, CutoverError> {
        let columns: Vec<String> = target
            .table_columns()?
            .into_iter()
            .filter(|c| c != "id" && T::COLUMNS.contains(&c.as_str()))
            .collect();

        debug!("Fixer for '{}' updates columns {:?}", T::TABLE, columns);
        Ok(columns)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn fix(&self, id: i64) -> Result<FixOutcome, CutoverError> {
        let _tmr = timer!(Level::Trace; "Fixer::fix");

        // Only "not found" has repair semantics; other read errors go back to the caller
        match self.base.find_by_id(id)? {
            Some(row) => {
                self.target.upsert(&row, &self.columns)?;
                debug!("Fixed {} id {}: copied from base", T::TABLE, id);
                Ok(FixOutcome::Upserted)
            }
            None => {
                let removed = self.target.delete_by_id(id)? > 0;
                debug!("Fixed {} id {}: absent from base, removed={}", T::TABLE, id, removed);
                Ok(FixOutcome::Deleted { removed })
            }
        }
    }

    pub fn fix_event(&self, evt: &InconsistentEvent) -> Result<FixOutcome, CutoverError> {
        self.fix(evt.id)
    }
}
