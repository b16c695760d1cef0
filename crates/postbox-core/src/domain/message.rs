//! Message model: the immutable envelope that travels through the outbox.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, Topic};

/// Extensible property bag carried on a header.
pub type Bag = HashMap<String, serde_json::Value>;

/// What kind of message this is.
///
/// `None` means the type was never configured and `Unacceptable` means the
/// message could not be read; neither can be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    Event,
    Document,
    #[default]
    None,
    Unacceptable,
}

impl MessageType {
    /// Can a message of this type be handed to a producer?
    pub fn is_dispatchable(self) -> bool {
        !matches!(self, MessageType::None | MessageType::Unacceptable)
    }
}

/// Routing and correlation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    id: MessageId,
    topic: Topic,
    message_type: MessageType,
    timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<MessageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    bag: Bag,
}

impl MessageHeader {
    pub fn new(id: MessageId, topic: Topic, message_type: MessageType) -> Self {
        Self {
            id,
            topic,
            message_type,
            timestamp: Utc::now(),
            correlation_id: None,
            content_type: None,
            partition_key: None,
            bag: Bag::new(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.correlation_id.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn bag(&self) -> &Bag {
        &self.bag
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_bag_item(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.bag.insert(key.into(), value);
        self
    }
}

/// Opaque payload. The outbox never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageBody(Vec<u8>);

impl MessageBody {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

/// An outbound message.
///
/// Immutable once built: there are no setters, only accessors and the
/// consuming `with_header` used when a header has to be re-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    header: MessageHeader,
    body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: impl Into<MessageBody>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Shorthand for the common case: fresh id, given topic and type.
    pub fn on_topic(
        topic: impl Into<Topic>,
        message_type: MessageType,
        body: impl Into<MessageBody>,
    ) -> Self {
        Self::new(
            MessageHeader::new(MessageId::generate(), topic.into(), message_type),
            body,
        )
    }

    pub fn id(&self) -> &MessageId {
        self.header.id()
    }

    pub fn topic(&self) -> &Topic {
        self.header.topic()
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Copy of this message carrying a different header.
    pub fn with_header(&self, header: MessageHeader) -> Self {
        Self {
            header,
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MessageType::Command, true)]
    #[case(MessageType::Event, true)]
    #[case(MessageType::Document, true)]
    #[case(MessageType::None, false)]
    #[case(MessageType::Unacceptable, false)]
    fn dispatchable_types(#[case] message_type: MessageType, #[case] expected: bool) {
        assert_eq!(message_type.is_dispatchable(), expected);
    }

    #[test]
    fn on_topic_generates_id_and_keeps_body() {
        let message = Message::on_topic("orders", MessageType::Event, "{\"n\":1}");
        assert_eq!(message.topic().as_str(), "orders");
        assert_eq!(message.body().as_str(), Some("{\"n\":1}"));
        assert!(!message.id().as_str().is_empty());
    }

    #[test]
    fn with_header_copies_body() {
        let message = Message::on_topic("orders", MessageType::Command, "body");
        let header = message
            .header()
            .clone()
            .with_correlation_id(MessageId::new("corr-1"))
            .with_bag_item("tenant", serde_json::json!("acme"));

        let derived = message.with_header(header);

        assert_eq!(derived.id(), message.id());
        assert_eq!(derived.body(), message.body());
        assert_eq!(derived.header().correlation_id().unwrap().as_str(), "corr-1");
        assert_eq!(derived.header().bag()["tenant"], "acme");
        assert!(message.header().correlation_id().is_none());
    }

    #[test]
    fn message_type_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&MessageType::Unacceptable).unwrap();
        assert_eq!(json, "\"UNACCEPTABLE\"");
    }
}
