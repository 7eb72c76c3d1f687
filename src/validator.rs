use std::collections::HashSet;
use std::time::Duration;

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::entity::Entity;
use crate::error::CutoverError;
use crate::events::{Direction, InconsistentEvent, InconsistentEventProducer, InconsistentType};
use crate::store::EntityStore;

pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// A one-shot scan gives up after this many read failures in a row. Tailing
/// scans never give up; they back off for one sleep interval instead.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Order `(src, dst)` as `(base, target)` for a pass with the given direction
pub fn orient<T: Entity>(
    direction: Direction,
    src: EntityStore<T>,
    dst: EntityStore<T>,
) -> (EntityStore<T>, EntityStore<T>) {
    match direction {
        Direction::Src => (src, dst),
        Direction::Dst => (dst, src),
    }
}

/// Counters for one validation run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub base_rows_scanned: u64,
    pub target_ids_scanned: u64,
    pub target_missing: u64,
    pub not_equal: u64,
    pub base_missing: u64,
    pub read_errors: u64,
    pub cancelled: bool,
}

impl ValidationSummary {
    pub fn drift(&self) -> u64 {
        self.target_missing + self.not_equal + self.base_missing
    }

    fn record(&mut self, kind: InconsistentType) {
        match kind {
            InconsistentType::TargetMissing => self.target_missing += 1,
            InconsistentType::NotEqual => self.not_equal += 1,
            InconsistentType::BaseMissing => self.base_missing += 1,
        }
    }

    fn merge(self, other: ValidationSummary) -> ValidationSummary {
        ValidationSummary {
            base_rows_scanned: self.base_rows_scanned + other.base_rows_scanned,
            target_ids_scanned: self.target_ids_scanned + other.target_ids_scanned,
            target_missing: self.target_missing + other.target_missing,
            not_equal: self.not_equal + other.not_equal,
            base_missing: self.base_missing + other.base_missing,
            read_errors: self.read_errors + other.read_errors,
            cancelled: self.cancelled || other.cancelled,
        }
    }
}

/// Compares `base` against `target` for one entity table and publishes an
/// [`InconsistentEvent`] for every difference. Never writes to either side.
///
/// Two scans run concurrently:
/// - base → target walks base rows in id order (optionally only rows updated
///   after a watermark) and reports rows missing from or unequal in target;
/// - target → base pages through target ids and reports ids base lacks.
///
/// Without a sleep interval each scan stops when it runs out of rows. With
/// one, it waits and polls again forever, until cancelled.
///
/// The base cursor is a plain offset. A base row deleted during a pass shifts
/// later rows down one position, so one unvisited row can be skipped; the next
/// incremental pass picks it up.
pub struct Validator<T: Entity> {
    base: EntityStore<T>,
    target: EntityStore<T>,
    direction: Direction,
    producer: InconsistentEventProducer,
    batch_size: i64,
    update_after: Option<i64>,
    sleep_interval: Option<Duration>,
    query_timeout: Duration,
}

impl<T: Entity> Validator<T> {
    pub fn new(
        base: EntityStore<T>,
        target: EntityStore<T>,
        direction: Direction,
        producer: InconsistentEventProducer,
    ) -> Self {
        Self {
            base,
            target,
            direction,
            producer,
            batch_size: DEFAULT_BATCH_SIZE,
            update_after: None,
            sleep_interval: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Only consider base rows updated strictly after `update_after_ms`.
    ///
    /// The bound is exclusive: a row whose update time equals the watermark
    /// is skipped. Callers that want `[watermark, now)` pass `watermark - 1`.
    /// The upper end is open; a tailing run keeps picking up newer rows.
    pub fn update_after(mut self, update_after_ms: i64) -> Self {
        self.update_after = Some(update_after_ms);
        self
    }

    /// Keep tailing with this poll interval; zero means a single pass
    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.sleep_interval.is_some()
    }

    /// Run both scans until they finish or `cancel` fires. Cancellation is a
    /// clean stop, reported through `ValidationSummary::cancelled`.
    pub async fn validate(&self, cancel: CancellationToken) -> ValidationSummary {
        let _tmr = timer!(Level::Debug; "Validator::validate");
        info!(
            "Validating {} (base={}, incremental={}, update_after={:?})",
            T::TABLE,
            self.direction,
            self.is_incremental(),
            self.update_after
        );

        let (forward, reverse) = tokio::join!(
            self.validate_base_to_target(&cancel),
            self.validate_target_to_base(&cancel)
        );

        let mut summary = forward.merge(reverse);
        summary.cancelled = cancel.is_cancelled();

        info!("Validation of {} finished: {:?}", T::TABLE, summary);
        summary
    }

    async fn validate_base_to_target(&self, cancel: &CancellationToken) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        let mut consecutive_errors = 0;
        let mut offset: i64 = 0;
        let update_after = self.update_after;

        while !cancel.is_cancelled() {
            let base_row = match self
                .run_query(cancel, &self.base, move |s| {
                    s.find_nth_updated_after(update_after, offset)
                })
                .await
            {
                None => break,
                Some(Ok(Some(row))) => row,
                Some(Ok(None)) => {
                    if self.wait_for_more(cancel).await {
                        continue;
                    }
                    break;
                }
                Some(Err(e)) => {
                    error!("Failed to read {} base row at offset {}: {}", T::TABLE, offset, e);
                    summary.read_errors += 1;
                    offset += 1;
                    if !self.tolerate_read_error(cancel, &mut consecutive_errors).await {
                        break;
                    }
                    continue;
                }
            };

            summary.base_rows_scanned += 1;
            let id = base_row.id();

            match self
                .run_query(cancel, &self.target, move |s| s.find_by_id(id))
                .await
            {
                None => break,
                Some(Ok(None)) => {
                    consecutive_errors = 0;
                    self.notify(InconsistentType::TargetMissing, id, &mut summary);
                }
                Some(Ok(Some(target_row))) => {
                    consecutive_errors = 0;
                    if !base_row.compare_to(&target_row) {
                        self.notify(InconsistentType::NotEqual, id, &mut summary);
                    }
                }
                Some(Err(e)) => {
                    error!("Failed to read {} target row {}: {}", T::TABLE, id, e);
                    summary.read_errors += 1;
                    if !self.tolerate_read_error(cancel, &mut consecutive_errors).await {
                        break;
                    }
                }
            }

            offset += 1;
        }

        debug!("{} base→target scan stopped at offset {}", T::TABLE, offset);
        summary
    }

    async fn validate_target_to_base(&self, cancel: &CancellationToken) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        let mut consecutive_errors = 0;
        let mut offset: i64 = 0;
        let batch_size = self.batch_size;

        while !cancel.is_cancelled() {
            let ids = match self
                .run_query(cancel, &self.target, move |s| s.find_ids(offset, batch_size))
                .await
            {
                None => break,
                Some(Ok(ids)) => ids,
                Some(Err(e)) => {
                    error!("Failed to read {} target ids at offset {}: {}", T::TABLE, offset, e);
                    summary.read_errors += 1;
                    offset += batch_size;
                    if !self.tolerate_read_error(cancel, &mut consecutive_errors).await {
                        break;
                    }
                    continue;
                }
            };

            if ids.is_empty() {
                if self.wait_for_more(cancel).await {
                    continue;
                }
                break;
            }

            let fetched = ids.len() as i64;
            summary.target_ids_scanned += ids.len() as u64;

            let lookup = ids.clone();
            match self
                .run_query(cancel, &self.base, move |s| s.find_existing_ids(&lookup))
                .await
            {
                None => break,
                Some(Ok(existing)) => {
                    consecutive_errors = 0;
                    // Presence by id is all that matters here; attribute drift is the other scan's job
                    let existing: HashSet<i64> = existing.into_iter().collect();
                    for id in ids.into_iter().filter(|id| !existing.contains(id)) {
                        self.notify(InconsistentType::BaseMissing, id, &mut summary);
                    }
                }
                Some(Err(e)) => {
                    error!(
                        "Failed to look up {} base ids for target offset {}: {}",
                        T::TABLE,
                        offset,
                        e
                    );
                    summary.read_errors += 1;
                    if !self.tolerate_read_error(cancel, &mut consecutive_errors).await {
                        break;
                    }
                }
            }

            offset += fetched;

            if fetched < batch_size && !self.wait_for_more(cancel).await {
                break;
            }
        }

        debug!("{} target→base scan stopped at offset {}", T::TABLE, offset);
        summary
    }

    /// Run one blocking store call under the per-query timeout.
    /// Returns `None` if the run was cancelled while waiting.
    async fn run_query<R, F>(
        &self,
        cancel: &CancellationToken,
        store: &EntityStore<T>,
        query: F,
    ) -> Option<Result<R, CutoverError>>
    where
        R: Send + 'static,
        F: FnOnce(&EntityStore<T>) -> Result<R, CutoverError> + Send + 'static,
    {
        let store = store.clone();
        let handle = tokio::task::spawn_blocking(move || query(&store));

        tokio::select! {
            _ = cancel.cancelled() => None,
            joined = tokio::time::timeout(self.query_timeout, handle) => Some(match joined {
                Err(_) => Err(CutoverError::QueryTimeout(
                    u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX),
                )),
                Ok(result) => result.map_err(CutoverError::from).and_then(|r| r),
            }),
        }
    }

    /// Sleep for one poll interval when tailing. Returns false when the scan
    /// should end instead: single-pass mode, or cancelled while asleep.
    async fn wait_for_more(&self, cancel: &CancellationToken) -> bool {
        match self.sleep_interval {
            None => false,
            Some(interval) => tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(interval) => true,
            },
        }
    }

    /// Decide whether a scan keeps going after a failed read
    async fn tolerate_read_error(&self, cancel: &CancellationToken, consecutive: &mut u32) -> bool {
        *consecutive += 1;
        if self.is_incremental() {
            return self.wait_for_more(cancel).await;
        }
        if *consecutive >= MAX_CONSECUTIVE_READ_ERRORS {
            warn!(
                "Giving up on {} scan after {} consecutive read errors",
                T::TABLE,
                consecutive
            );
            return false;
        }
        true
    }

    fn notify(&self, kind: InconsistentType, id: i64, summary: &mut ValidationSummary) {
        let evt = InconsistentEvent::new(kind, id, self.direction);
        summary.record(kind);
        if let Err(e) = self.producer.produce(&evt) {
            error!("Failed to publish {:?}: {}", evt, e);
        }
    }
}
