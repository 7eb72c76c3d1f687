use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, trace, warn};
use tokio::sync::mpsc;

use crate::error::CutoverError;

/// Producer half of a message broker client
pub trait MessageProducer: Send + Sync {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), CutoverError>;
}

/// A delivered message. `attempt` starts at 1 and grows with each redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub attempt: u32,
}

struct Topic {
    sender: mpsc::UnboundedSender<Message>,
    // Taken by the single consumer group attached to this topic
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process broker with one consumer group per topic.
///
/// Messages published before the consumer attaches are buffered. Delivery is
/// at-least-once: a consumer hands a failed message back through
/// [`Subscription::redeliver`].
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the consumer group for `topic`
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, CutoverError> {
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(topic.to_owned()).or_insert_with(Topic::new);

        let receiver = entry.receiver.take().ok_or_else(|| {
            CutoverError::Error(format!("Topic '{}' already has a consumer", topic))
        })?;

        debug!("Consumer attached to topic '{}'", topic);

        Ok(Subscription {
            topic: topic.to_owned(),
            receiver,
            sender: entry.sender.clone(),
        })
    }
}

impl MessageProducer for InMemoryBroker {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), CutoverError> {
        let sender = {
            let mut topics = self.topics.lock().unwrap();
            topics
                .entry(topic.to_owned())
                .or_insert_with(Topic::new)
                .sender
                .clone()
        };

        sender
            .send(Message {
                topic: topic.to_owned(),
                payload,
                attempt: 1,
            })
            .map_err(|_| CutoverError::Publish(format!("Topic '{}' consumer has gone away", topic)))
    }
}

/// Accepts every message and keeps none. For report-only runs where nobody
/// consumes the events.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardProducer;

impl MessageProducer for DiscardProducer {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), CutoverError> {
        trace!("Discarding {} byte message for '{}'", payload.len(), topic);
        Ok(())
    }
}

/// Consumer half for one topic
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    sender: mpsc::UnboundedSender<Message>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Queue a message for another delivery attempt
    pub fn redeliver(&self, mut message: Message) -> bool {
        message.attempt += 1;
        match self.sender.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to redeliver message on topic '{}': {}", self.topic, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_buffer_until_subscribed() {
        let broker = InMemoryBroker::new();
        broker.send("inconsistent_interactive", b"one".to_vec()).unwrap();
        broker.send("inconsistent_interactive", b"two".to_vec()).unwrap();

        let mut sub = broker.subscribe("inconsistent_interactive").unwrap();
        assert_eq!(sub.try_recv().unwrap().payload, b"one");
        assert_eq!(sub.try_recv().unwrap().payload, b"two");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_topics_are_isolated() {
        let broker = InMemoryBroker::new();
        broker.send("a", b"for a".to_vec()).unwrap();

        let mut sub_b = broker.subscribe("b").unwrap();
        assert!(sub_b.try_recv().is_none());

        let mut sub_a = broker.subscribe("a").unwrap();
        assert_eq!(sub_a.try_recv().unwrap().topic, "a");
    }

    #[test]
    fn test_single_consumer_group_per_topic() {
        let broker = InMemoryBroker::new();
        let _sub = broker.subscribe("t").unwrap();
        assert!(broker.subscribe("t").is_err());
    }

    #[test]
    fn test_redeliver_increments_attempt() {
        let broker = InMemoryBroker::new();
        broker.send("t", b"x".to_vec()).unwrap();
        let mut sub = broker.subscribe("t").unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(sub.redeliver(first));

        let second = sub.try_recv().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.payload, b"x");
    }

    #[test]
    fn test_discard_producer_accepts_and_keeps_nothing() {
        let producer = DiscardProducer;
        for i in 0..1000u32 {
            producer.send("t", i.to_le_bytes().to_vec()).unwrap();
        }
    }

    #[test]
    fn test_send_fails_after_consumer_dropped() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("t").unwrap();
        drop(sub);

        let result = broker.send("t", b"lost".to_vec());
        assert!(matches!(result, Err(CutoverError::Publish(_))));
    }
}
