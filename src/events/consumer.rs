use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::entity::Entity;
use crate::error::CutoverError;
use crate::fixer::{FixOutcome, Fixer};
use crate::store::EntityStore;

use super::{Direction, InconsistentEvent, Message, Subscription};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Drains drift events for one table and repairs each row.
///
/// Events raised with `src` as base are fixed source → target; events raised
/// with `dst` as base are fixed target → source.
pub struct FixerConsumer<T: Entity> {
    src_first: Arc<Fixer<T>>,
    dst_first: Arc<Fixer<T>>,
    max_attempts: u32,
}

impl<T: Entity> FixerConsumer<T> {
    pub fn new(src: EntityStore<T>, dst: EntityStore<T>) -> Result<Self, CutoverError> {
        Ok(Self {
            src_first: Arc::new(Fixer::new(src.clone(), dst.clone())?),
            dst_first: Arc::new(Fixer::new(dst, src)?),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn fixer_for(&self, direction: Direction) -> Arc<Fixer<T>> {
        match direction {
            Direction::Src => self.src_first.clone(),
            Direction::Dst => self.dst_first.clone(),
        }
    }

    /// Decode one message and apply the matching fix
    pub async fn handle(&self, msg: &Message) -> Result<FixOutcome, CutoverError> {
        let evt = InconsistentEvent::from_payload(&msg.payload)?;
        let fixer = self.fixer_for(evt.direction);

        let outcome = tokio::task::spawn_blocking(move || fixer.fix_event(&evt)).await??;
        Ok(outcome)
    }

    /// Apply one delivered message, handing it back to `sub` if the fix
    /// failed and attempts remain
    pub async fn process(&self, sub: &Subscription, msg: Message) -> Delivery {
        match self.handle(&msg).await {
            Ok(outcome) => {
                debug!("Applied fix {:?} for message on '{}'", outcome, msg.topic);
                Delivery::Applied
            }
            Err(CutoverError::JsonError(e)) => {
                error!("Dropping undecodable message on '{}': {}", msg.topic, e);
                Delivery::Dropped
            }
            Err(e) if msg.attempt < self.max_attempts => {
                warn!(
                    "Fix failed on attempt {}/{}: {}; redelivering",
                    msg.attempt, self.max_attempts, e
                );
                if sub.redeliver(msg) {
                    Delivery::Redelivered
                } else {
                    Delivery::Dropped
                }
            }
            Err(e) => {
                error!(
                    "Giving up on message after {} attempts: {} (payload: {})",
                    msg.attempt,
                    e,
                    String::from_utf8_lossy(&msg.payload)
                );
                Delivery::Dropped
            }
        }
    }

    /// Consume `sub` until cancelled or the topic closes.
    ///
    /// A message whose fix fails goes back on the topic until it has been
    /// tried `max_attempts` times. Payloads that do not decode are dropped.
    pub async fn consume(&self, sub: &mut Subscription, cancel: CancellationToken) -> ConsumeStats {
        info!("Fixer consumer for {} listening on '{}'", T::TABLE, sub.topic());
        let mut stats = ConsumeStats::default();

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = sub.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            stats.record(self.process(sub, msg).await);
        }

        info!("Fixer consumer for {} stopped: {:?}", T::TABLE, stats);
        stats
    }

    /// Process whatever is queued on `sub` right now, redeliveries included
    pub async fn drain(&self, sub: &mut Subscription) -> ConsumeStats {
        let mut stats = ConsumeStats::default();
        while let Some(msg) = sub.try_recv() {
            stats.record(self.process(sub, msg).await);
        }
        stats
    }
}

/// What happened to one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Redelivered,
    Dropped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeStats {
    pub applied: u64,
    pub redelivered: u64,
    pub dropped: u64,
}

impl ConsumeStats {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Applied => self.applied += 1,
            Delivery::Redelivered => self.redelivered += 1,
            Delivery::Dropped => self.dropped += 1,
        }
    }

    pub fn merge(self, other: ConsumeStats) -> ConsumeStats {
        ConsumeStats {
            applied: self.applied + other.applied,
            redelivered: self.redelivered + other.redelivered,
            dropped: self.dropped + other.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::database::Database;
    use crate::events::{InMemoryBroker, InconsistentEventProducer, InconsistentType, MessageProducer};
    use crate::interactive::Interactive;
    use crate::test_utils::{interactive, TestBackends};
    use pretty_assertions::assert_eq;

    fn message(evt: &InconsistentEvent) -> Message {
        Message {
            topic: "t".to_owned(),
            payload: evt.to_payload().unwrap(),
            attempt: 1,
        }
    }

    fn consumer(backends: &TestBackends) -> FixerConsumer<Interactive> {
        FixerConsumer::new(backends.src_store(), backends.dst_store()).unwrap()
    }

    #[tokio::test]
    async fn test_src_event_fixes_target() {
        let backends = TestBackends::new();
        backends.src_store().create(&interactive(1, 3, 10)).unwrap();

        let evt = InconsistentEvent::new(InconsistentType::TargetMissing, 1, Direction::Src);
        let outcome = consumer(&backends).handle(&message(&evt)).await.unwrap();

        assert_eq!(outcome, FixOutcome::Upserted);
        assert_eq!(backends.dst_store().find_by_id(1).unwrap(), Some(interactive(1, 3, 10)));
    }

    #[tokio::test]
    async fn test_dst_event_fixes_source() {
        let backends = TestBackends::new();
        backends.src_store().create(&interactive(5, 1, 10)).unwrap();

        // Target is base here and lacks the row, so source loses it
        let evt = InconsistentEvent::new(InconsistentType::TargetMissing, 5, Direction::Dst);
        let outcome = consumer(&backends).handle(&message(&evt)).await.unwrap();

        assert_eq!(outcome, FixOutcome::Deleted { removed: true });
        assert_eq!(backends.src_store().find_by_id(5).unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_an_error() {
        let backends = TestBackends::new();
        let msg = Message {
            topic: "t".to_owned(),
            payload: b"not json".to_vec(),
            attempt: 1,
        };
        let result = consumer(&backends).handle(&msg).await;
        assert!(matches!(result, Err(CutoverError::JsonError(_))));
    }

    #[tokio::test]
    async fn test_consume_until_cancelled() {
        let backends = TestBackends::new();
        backends.src_store().create(&interactive(1, 2, 10)).unwrap();
        backends.dst_store().create(&interactive(9, 2, 10)).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        let producer = InconsistentEventProducer::new(broker.clone(), "inconsistent_interactive");
        broker.send("inconsistent_interactive", b"garbage".to_vec()).unwrap();
        producer
            .produce(&InconsistentEvent::new(InconsistentType::TargetMissing, 1, Direction::Src))
            .unwrap();
        producer
            .produce(&InconsistentEvent::new(InconsistentType::BaseMissing, 9, Direction::Src))
            .unwrap();

        let mut sub = broker.subscribe("inconsistent_interactive").unwrap();
        let cancel = CancellationToken::new();
        let consumer = consumer(&backends);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.consume(&mut sub, cancel).await }
        });

        let dst = backends.dst_store();
        let mut converged = false;
        for _ in 0..100 {
            if dst.find_by_id(1).unwrap().is_some() && dst.find_by_id(9).unwrap().is_none() {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(converged);

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.dropped, 1);
    }

    fn drop_target_table(backends: &TestBackends) {
        backends
            .dst_pool()
            .get()
            .unwrap()
            .execute_batch("DROP TABLE interactives")
            .unwrap();
    }

    fn target_missing_on(broker: &Arc<InMemoryBroker>, topic: &str, id: i64) {
        InconsistentEventProducer::new(broker.clone(), topic)
            .produce(&InconsistentEvent::new(InconsistentType::TargetMissing, id, Direction::Src))
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_fix_converges_on_redelivery() {
        let backends = TestBackends::new();
        let consumer = consumer(&backends).max_attempts(3);
        // Break the target table after the fixers have introspected it
        drop_target_table(&backends);
        backends.src_store().create(&interactive(1, 1, 1)).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        target_missing_on(&broker, "t", 1);
        let mut sub = broker.subscribe("t").unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(consumer.process(&sub, first).await, Delivery::Redelivered);

        Database::ensure_schema::<Interactive>(&backends.dst_pool()).unwrap();

        let second = sub.try_recv().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(consumer.process(&sub, second).await, Delivery::Applied);

        assert!(sub.try_recv().is_none());
        assert_eq!(backends.dst_store().find_by_id(1).unwrap(), Some(interactive(1, 1, 1)));
    }

    #[tokio::test]
    async fn test_failed_fix_is_dropped_after_max_attempts() {
        let backends = TestBackends::new();
        let consumer = consumer(&backends).max_attempts(2);
        drop_target_table(&backends);
        backends.src_store().create(&interactive(1, 1, 1)).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        target_missing_on(&broker, "t", 1);
        let mut sub = broker.subscribe("t").unwrap();

        let stats = consumer.drain(&mut sub).await;
        assert_eq!(
            stats,
            ConsumeStats {
                applied: 0,
                redelivered: 1,
                dropped: 1
            }
        );
        assert!(sub.try_recv().is_none());

        // The given-up message left the target untouched
        Database::ensure_schema::<Interactive>(&backends.dst_pool()).unwrap();
        assert_eq!(backends.dst_store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_retries_until_fix_succeeds() {
        let backends = TestBackends::new();
        let consumer = consumer(&backends).max_attempts(u32::MAX);
        drop_target_table(&backends);
        backends.src_store().create(&interactive(1, 1, 1)).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        target_missing_on(&broker, "t", 1);
        let mut sub = broker.subscribe("t").unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.consume(&mut sub, cancel).await }
        });

        // Let a few attempts fail, then repair the table
        tokio::time::sleep(Duration::from_millis(50)).await;
        Database::ensure_schema::<Interactive>(&backends.dst_pool()).unwrap();

        let dst = backends.dst_store();
        let mut converged = false;
        for _ in 0..100 {
            if dst.find_by_id(1).unwrap().is_some() {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(converged);

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.applied, 1);
        assert!(stats.redelivered >= 1);
        assert_eq!(stats.dropped, 0);
    }
}
