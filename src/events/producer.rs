use std::sync::Arc;

use log::trace;

use crate::error::CutoverError;

use super::{InconsistentEvent, MessageProducer};

/// Publishes drift events for one migrated table to its topic
#[derive(Clone)]
pub struct InconsistentEventProducer {
    producer: Arc<dyn MessageProducer>,
    topic: String,
}

impl InconsistentEventProducer {
    pub fn new(producer: Arc<dyn MessageProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn produce(&self, evt: &InconsistentEvent) -> Result<(), CutoverError> {
        let payload = evt.to_payload()?;
        trace!("Publishing {:?} to '{}'", evt, self.topic);
        self.producer.send(&self.topic, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Direction, InMemoryBroker, InconsistentType};

    #[test]
    fn test_produce_encodes_to_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = InconsistentEventProducer::new(broker.clone(), "inconsistent_interactive");

        let evt = InconsistentEvent::new(InconsistentType::NotEqual, 42, Direction::Dst);
        producer.produce(&evt).unwrap();

        let mut sub = broker.subscribe("inconsistent_interactive").unwrap();
        let msg = sub.try_recv().unwrap();
        assert_eq!(InconsistentEvent::from_payload(&msg.payload).unwrap(), evt);
    }
}
