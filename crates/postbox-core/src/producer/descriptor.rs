//! Producer descriptor: one broker client plus the capabilities it offers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::Topic;
use crate::ports::{
    BulkMessageProducerAsync, CloseProducer, MessageProducerAsync, MessageProducerSync,
    PublishConfirmation,
};

/// Publication metadata: where a producer sends, and for which request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: Topic,
    pub request_type: Option<String>,
}

impl Publication {
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            request_type: None,
        }
    }

    pub fn for_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }
}

/// A registered producer.
///
/// Capabilities are fixed once the descriptor is built; the mediator reads
/// them but never changes them.
pub struct Producer {
    publication: Publication,
    sync: Option<Arc<dyn MessageProducerSync>>,
    asynchronous: Option<Arc<dyn MessageProducerAsync>>,
    bulk: Option<Arc<dyn BulkMessageProducerAsync>>,
    confirmation: Option<Arc<dyn PublishConfirmation>>,
    closer: Option<Arc<dyn CloseProducer>>,
    closed: AtomicBool,
}

impl Producer {
    pub fn new(publication: Publication) -> Self {
        Self {
            publication,
            sync: None,
            asynchronous: None,
            bulk: None,
            confirmation: None,
            closer: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_sync(mut self, producer: Arc<dyn MessageProducerSync>) -> Self {
        self.sync = Some(producer);
        self
    }

    pub fn with_async(mut self, producer: Arc<dyn MessageProducerAsync>) -> Self {
        self.asynchronous = Some(producer);
        self
    }

    pub fn with_bulk(mut self, producer: Arc<dyn BulkMessageProducerAsync>) -> Self {
        self.bulk = Some(producer);
        self
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn PublishConfirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_closer(mut self, closer: Arc<dyn CloseProducer>) -> Self {
        self.closer = Some(closer);
        self
    }

    pub fn publication(&self) -> &Publication {
        &self.publication
    }

    pub fn topic(&self) -> &Topic {
        &self.publication.topic
    }

    pub fn sync(&self) -> Option<&Arc<dyn MessageProducerSync>> {
        self.sync.as_ref()
    }

    pub fn asynchronous(&self) -> Option<&Arc<dyn MessageProducerAsync>> {
        self.asynchronous.as_ref()
    }

    pub fn bulk(&self) -> Option<&Arc<dyn BulkMessageProducerAsync>> {
        self.bulk.as_ref()
    }

    pub fn confirmation(&self) -> Option<&Arc<dyn PublishConfirmation>> {
        self.confirmation.as_ref()
    }

    /// Does this producer confirm sends out of band?
    pub fn confirms_publication(&self) -> bool {
        self.confirmation.is_some()
    }

    /// Close the underlying client. Only the first call reaches it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("publication", &self.publication)
            .field("sync", &self.sync.is_some())
            .field("async", &self.asynchronous.is_some())
            .field("bulk", &self.bulk.is_some())
            .field("confirmation", &self.confirmation.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
