use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::entity::Entity;
use crate::error::CutoverError;
use crate::events::{Direction, InconsistentEventProducer};
use crate::pattern::{Backend, Pattern};
use crate::pool::DoubleWritePool;
use crate::store::EntityStore;
use crate::validator::{orient, Validator, DEFAULT_BATCH_SIZE, DEFAULT_QUERY_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Full,
    Incremental,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Full => write!(f, "full"),
            RunKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// What an active validation run was started with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_id: u64,
    pub direction: Direction,
    /// Epoch milliseconds
    pub started_at: i64,
    pub update_after: Option<i64>,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub pattern: Pattern,
    pub full: Option<RunStatus>,
    pub incr: Option<RunStatus>,
}

struct ActiveRun {
    status: RunStatus,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    full: Option<ActiveRun>,
    incr: Option<ActiveRun>,
    // Stopped runs that may still be winding down
    stopping_full: Option<JoinHandle<()>>,
    stopping_incr: Option<JoinHandle<()>>,
    next_run_id: u64,
    is_shutting_down: bool,
}

impl SchedulerState {
    fn slot_mut(&mut self, kind: RunKind) -> &mut Option<ActiveRun> {
        match kind {
            RunKind::Full => &mut self.full,
            RunKind::Incremental => &mut self.incr,
        }
    }

    fn stopping_mut(&mut self, kind: RunKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            RunKind::Full => &mut self.stopping_full,
            RunKind::Incremental => &mut self.stopping_incr,
        }
    }

    /// Cancel the active run of `kind` and hand back every task of that kind
    /// that has not been awaited yet
    fn take_handles(&mut self, kind: RunKind) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self.stopping_mut(kind).take().into_iter().collect();
        if let Some(run) = self.slot_mut(kind).take() {
            info!("Cancelling {} validation run {}", kind, run.status.run_id);
            run.cancel.cancel();
            handles.push(run.handle);
        }
        handles
    }

    fn check_shutting_down_locked(&self) -> Result<(), CutoverError> {
        if self.is_shutting_down {
            Err(CutoverError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

/// Owns the migration's mutable state: the pool's pattern and at most one
/// full and one incremental validation run.
///
/// Every mutation goes through one mutex, so a stop or a replacement is
/// visible to the next caller before it can start anything.
pub struct Scheduler<T: Entity> {
    pool: Arc<DoubleWritePool>,
    src: EntityStore<T>,
    dst: EntityStore<T>,
    producer: InconsistentEventProducer,
    batch_size: i64,
    query_timeout: Duration,
    state: Arc<Mutex<SchedulerState>>,
}

impl<T: Entity> Scheduler<T> {
    pub fn new(pool: Arc<DoubleWritePool>, producer: InconsistentEventProducer) -> Self {
        let src = EntityStore::new(pool.backend_pool(Backend::Source).clone());
        let dst = EntityStore::new(pool.backend_pool(Backend::Target).clone());
        Self {
            pool,
            src,
            dst,
            producer,
            batch_size: DEFAULT_BATCH_SIZE,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn src_only(&self) {
        self.change_pattern(Pattern::SrcOnly);
    }

    pub fn src_first(&self) {
        self.change_pattern(Pattern::SrcFirst);
    }

    pub fn dst_first(&self) {
        self.change_pattern(Pattern::DstFirst);
    }

    pub fn dst_only(&self) {
        self.change_pattern(Pattern::DstOnly);
    }

    /// Switch to the pattern named `name` (`src_only`, `src_first`, ...)
    pub fn set_pattern(&self, name: &str) -> Result<Pattern, CutoverError> {
        let pattern = Pattern::parse(name)?;
        self.change_pattern(pattern);
        Ok(pattern)
    }

    fn change_pattern(&self, pattern: Pattern) {
        let _state = self.state.lock().unwrap();
        self.pool.change_pattern(pattern);
    }

    pub fn start_full_validation(&self) -> Result<RunStatus, CutoverError> {
        self.start_run(RunKind::Full, None)
    }

    pub fn stop_full_validation(&self) -> bool {
        self.stop_run(RunKind::Full)
    }

    /// Start tailing rows updated after `update_after_ms`, polling every
    /// `interval_ms` once caught up. A non-positive interval makes it a
    /// single pass.
    pub fn start_incr_validation(
        &self,
        update_after_ms: i64,
        interval_ms: i64,
    ) -> Result<RunStatus, CutoverError> {
        let interval = Duration::from_millis(u64::try_from(interval_ms).unwrap_or(0));
        self.start_run(RunKind::Incremental, Some((update_after_ms, interval)))
    }

    pub fn stop_incr_validation(&self) -> bool {
        self.stop_run(RunKind::Incremental)
    }

    pub fn status(&self) -> Result<SchedulerStatus, CutoverError> {
        let state = self.state.lock().unwrap();
        Ok(SchedulerStatus {
            pattern: self.pool.pattern()?,
            full: state.full.as_ref().map(|run| run.status.clone()),
            incr: state.incr.as_ref().map(|run| run.status.clone()),
        })
    }

    fn start_run(
        &self,
        kind: RunKind,
        incremental: Option<(i64, Duration)>,
    ) -> Result<RunStatus, CutoverError> {
        let _tmr = timer!(Level::Trace; "Scheduler::start_run mutex");
        let mut state = self.state.lock().unwrap();
        state.check_shutting_down_locked()?;

        // Base is whichever backend the current pattern trusts
        let direction = self.pool.pattern()?.direction();
        let (base, target) = orient(direction, self.src.clone(), self.dst.clone());

        let mut validator = Validator::new(base, target, direction, self.producer.clone())
            .batch_size(self.batch_size)
            .query_timeout(self.query_timeout);
        if let Some((update_after, interval)) = incremental {
            validator = validator.update_after(update_after).sleep_interval(interval);
        }

        // Cancel the run being replaced, or a stopped one, before the new one can scan
        let previous = state.take_handles(kind);

        state.next_run_id += 1;
        let run_id = state.next_run_id;
        let status = RunStatus {
            run_id,
            direction,
            started_at: chrono::Utc::now().timestamp_millis(),
            update_after: incremental.map(|(update_after, _)| update_after),
            interval_ms: incremental
                .map(|(_, interval)| u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)),
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let state_ref = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            for handle in previous {
                if let Err(e) = handle.await {
                    warn!("Previous {} validation run ended abnormally: {}", kind, e);
                }
            }

            let summary = validator.validate(token).await;
            info!(
                "{} validation run {} ended: drift={}, read_errors={}, cancelled={}",
                kind,
                run_id,
                summary.drift(),
                summary.read_errors,
                summary.cancelled
            );

            Self::on_run_complete(&state_ref, kind, run_id);
        });

        info!("Started {} validation run {} with base {}", kind, run_id, direction);

        *state.slot_mut(kind) = Some(ActiveRun {
            status: status.clone(),
            cancel,
            handle,
        });

        Ok(status)
    }

    /// Cancel the active run of `kind`. Its task is awaited by the next start
    /// of the same kind or by `shutdown`.
    fn stop_run(&self, kind: RunKind) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.slot_mut(kind).take() {
            Some(run) => {
                info!("Stopping {} validation run {}", kind, run.status.run_id);
                run.cancel.cancel();
                // A start always takes the previous stopped handle, so this slot is empty
                *state.stopping_mut(kind) = Some(run.handle);
                true
            }
            None => {
                debug!("No {} validation run to stop", kind);
                false
            }
        }
    }

    /// Clears the slot only if it still holds `run_id`; a newer run may have
    /// taken it in the meantime.
    fn on_run_complete(state: &Mutex<SchedulerState>, kind: RunKind, run_id: u64) {
        let mut state = state.lock().unwrap();
        let slot = state.slot_mut(kind);
        if slot.as_ref().is_some_and(|run| run.status.run_id == run_id) {
            *slot = None;
            debug!("Cleared {} validation slot for run {}", kind, run_id);
        }
    }

    /// Cancel both runs and wait for them. Nothing can be started afterwards.
    pub async fn shutdown(&self) {
        let handles: Vec<(RunKind, JoinHandle<()>)> = {
            let mut state = self.state.lock().unwrap();
            state.is_shutting_down = true;

            [RunKind::Full, RunKind::Incremental]
                .into_iter()
                .flat_map(|kind| {
                    state
                        .take_handles(kind)
                        .into_iter()
                        .map(move |handle| (kind, handle))
                })
                .collect()
        };

        for (kind, handle) in handles {
            info!("Waiting for {} validation run to stop...", kind);
            let _ = handle.await;
        }
        info!("Scheduler shut down");
    }
}
