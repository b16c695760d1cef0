//! ProducerRegistry - topic → producer
//!
//! Built during wiring (mutable), then shared read-only behind an `Arc`.
//! No locks on the lookup path.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::descriptor::{Producer, Publication};
use crate::domain::Topic;
use crate::error::{OutboxError, OutboxResult};

#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: HashMap<Topic, Arc<Producer>>,
    /// Registration order, so enumeration is stable.
    order: Vec<Topic>,
    default_producer: Option<Arc<Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Producer) -> OutboxResult<()> {
        let topic = producer.topic().clone();
        if self.producers.contains_key(&topic) {
            return Err(OutboxError::DuplicateProducer(topic));
        }
        self.order.push(topic.clone());
        self.producers.insert(topic, Arc::new(producer));
        Ok(())
    }

    /// Producer used for topics nobody registered.
    pub fn set_default(&mut self, producer: Producer) {
        self.default_producer = Some(Arc::new(producer));
    }

    pub fn lookup_by_topic(&self, topic: &Topic) -> OutboxResult<Arc<Producer>> {
        self.producers
            .get(topic)
            .or(self.default_producer.as_ref())
            .cloned()
            .ok_or_else(|| OutboxError::ProducerNotFound(topic.clone()))
    }

    pub fn lookup_publication(&self, request_type: &str) -> Option<&Publication> {
        self.order
            .iter()
            .filter_map(|topic| self.producers.get(topic))
            .chain(self.default_producer.iter())
            .map(|producer| producer.publication())
            .find(|publication| publication.request_type.as_deref() == Some(request_type))
    }

    /// All producers in registration order, default last.
    pub fn producers(&self) -> Vec<Arc<Producer>> {
        self.order
            .iter()
            .filter_map(|topic| self.producers.get(topic))
            .chain(self.default_producer.iter())
            .cloned()
            .collect()
    }

    pub fn close_all(&self) {
        for producer in self.producers() {
            producer.close();
        }
        info!(count = self.len(), "closed all producers");
    }

    pub fn len(&self) -> usize {
        self.producers.len() + usize::from(self.default_producer.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
