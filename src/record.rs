//! Record and acknowledgement types
//!
//! Value types exchanged between callers, the publisher and the producer
//! contract: messages to publish, publish requests grouping a state snapshot
//! with its domain events, and broker acknowledgements.

use crate::error::{Result, StatelineError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A topic-partition pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A single record header
///
/// Headers preserve caller order and are passed through to the broker
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header name
    pub name: String,
    /// Header value
    pub value: Bytes,
}

impl RecordHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message handed to the publisher
///
/// Key and value are owned by the record; user payloads stay opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageToPublish {
    /// Record key
    pub key: String,
    /// Record value
    pub value: Bytes,
    /// Record headers, in caller order
    pub headers: Vec<RecordHeader>,
}

impl MessageToPublish {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// Attach a header, preserving insertion order.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader::new(name, value));
        self
    }
}

/// A request to atomically publish an aggregate's state snapshot and the
/// events that produced it
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Aggregate identity; equals the state record's key
    pub aggregate_id: String,
    /// Updated state snapshot, written to the state topic
    pub state: MessageToPublish,
    /// Domain events, written to the events topic
    pub events: Vec<MessageToPublish>,
}

impl PublishRequest {
    /// Build a publish request, validating that the state record is keyed by
    /// the aggregate id.
    pub fn new(
        aggregate_id: impl Into<String>,
        state: MessageToPublish,
        events: Vec<MessageToPublish>,
    ) -> Result<Self> {
        let aggregate_id = aggregate_id.into();
        if aggregate_id.is_empty() {
            return Err(StatelineError::InvalidRequest(
                "aggregate id must not be empty".to_string(),
            ));
        }
        if state.key != aggregate_id {
            return Err(StatelineError::InvalidRequest(format!(
                "state record key '{}' does not match aggregate id '{}'",
                state.key, aggregate_id
            )));
        }
        Ok(Self {
            aggregate_id,
            state,
            events,
        })
    }

    /// Number of physical records this request expands to: one per event
    /// plus the state record.
    pub fn record_count(&self) -> usize {
        self.events.len() + 1
    }
}

/// Broker acknowledgement for a single record
///
/// Offsets are monotonically non-decreasing per topic-partition within a
/// producer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAck {
    /// Aggregate the record belongs to, if it carried one
    pub aggregate_id: Option<String>,
    /// Topic the record landed on
    pub topic: String,
    /// Partition the record landed on
    pub partition: i32,
    /// Assigned offset
    pub offset: i64,
}

impl RecordAck {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_request_validates_key() {
        let state = MessageToPublish::new("acct-1", "snapshot");
        assert!(PublishRequest::new("acct-1", state.clone(), vec![]).is_ok());

        let err = PublishRequest::new("acct-2", state, vec![]).unwrap_err();
        assert!(matches!(err, StatelineError::InvalidRequest(_)));
    }

    #[test]
    fn test_publish_request_rejects_empty_aggregate_id() {
        let state = MessageToPublish::new("", "snapshot");
        assert!(PublishRequest::new("", state, vec![]).is_err());
    }

    #[test]
    fn test_record_count_includes_state() {
        let state = MessageToPublish::new("acct-1", "snapshot");
        let events = vec![
            MessageToPublish::new("acct-1", "opened"),
            MessageToPublish::new("acct-1", "credited"),
        ];
        let req = PublishRequest::new("acct-1", state, events).unwrap();
        assert_eq!(req.record_count(), 3);
    }

    #[test]
    fn test_headers_preserve_order() {
        let msg = MessageToPublish::new("k", "v")
            .with_header("first", "1")
            .with_header("second", "2");
        assert_eq!(msg.headers[0].name, "first");
        assert_eq!(msg.headers[1].name, "second");
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("aggregate-state", 4);
        assert_eq!(tp.to_string(), "aggregate-state/4");
    }
}
