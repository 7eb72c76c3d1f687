mod broker;
mod consumer;
mod producer;

pub use broker::{DiscardProducer, InMemoryBroker, Message, MessageProducer, Subscription};
pub use consumer::{ConsumeStats, Delivery, FixerConsumer};
pub use producer::InconsistentEventProducer;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::CutoverError;

/// What kind of drift a validation pass detected for one row
#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistentType {
    /// Row exists in base but not in target
    #[strum(serialize = "target_missing")]
    #[serde(rename = "target_missing")]
    TargetMissing,
    /// Row exists on both sides but the attributes differ
    #[strum(serialize = "neq")]
    #[serde(rename = "neq")]
    NotEqual,
    /// Row exists in target but not in base
    #[strum(serialize = "base_missing")]
    #[serde(rename = "base_missing")]
    BaseMissing,
}

/// Which backend was base (ground truth) for the pass that raised an event
#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Src,
    Dst,
}

/// One piece of drift, as carried over the event channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistentEvent {
    #[serde(rename = "Type")]
    pub kind: InconsistentType,
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Direction")]
    pub direction: Direction,
}

impl InconsistentEvent {
    pub fn new(kind: InconsistentType, id: i64, direction: Direction) -> Self {
        Self { kind, id, direction }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, CutoverError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CutoverError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_wire_shape() {
        let evt = InconsistentEvent::new(InconsistentType::TargetMissing, 1, Direction::Src);
        let json: serde_json::Value = serde_json::from_slice(&evt.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Type": "target_missing", "ID": 1, "Direction": "src"})
        );
    }

    #[test]
    fn test_event_decodes_from_wire() {
        let evt = InconsistentEvent::from_payload(br#"{"Type":"base_missing","ID":7,"Direction":"dst"}"#)
            .unwrap();
        assert_eq!(evt, InconsistentEvent::new(InconsistentType::BaseMissing, 7, Direction::Dst));

        let evt = InconsistentEvent::from_payload(br#"{"Type":"neq","ID":1,"Direction":"src"}"#).unwrap();
        assert_eq!(evt.kind, InconsistentType::NotEqual);
    }

    #[test]
    fn test_event_rejects_unknown_type() {
        let result = InconsistentEvent::from_payload(br#"{"Type":"gone","ID":1,"Direction":"src"}"#);
        assert!(matches!(result, Err(CutoverError::JsonError(_))));
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(Direction::Src.as_ref(), "src");
        assert_eq!("dst".parse::<Direction>().unwrap(), Direction::Dst);
        assert!("SRC".parse::<Direction>().is_err());
    }
}
