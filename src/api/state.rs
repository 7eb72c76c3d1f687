use std::sync::Arc;

use crate::entity::Entity;
use crate::scheduler::Scheduler;

/// Shared application state passed to all Axum handlers via `.with_state()`.
pub struct AppState<T: Entity> {
    pub scheduler: Arc<Scheduler<T>>,
}

impl<T: Entity> AppState<T> {
    pub fn new(scheduler: Arc<Scheduler<T>>) -> Self {
        Self { scheduler }
    }
}

// Derived Clone would require `T: Clone` on the state itself
impl<T: Entity> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}
