//! Topic-level circuit breaker for sweeps.
//!
//! A topic whose send fails during a sweep is "tripped" and left out of the
//! next `cooldown_count` sweeps, so one dead broker route does not eat every
//! sweep's page.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::domain::Topic;

pub trait OutboxCircuitBreaker: Send + Sync {
    /// Called at the start of every sweep.
    fn cool_down(&self);

    fn trip_topic(&self, topic: &Topic);

    fn tripped_topics(&self) -> Vec<Topic>;
}

#[derive(Debug)]
pub struct InMemoryOutboxCircuitBreaker {
    cooldown_count: u32,
    /// topic → sweeps left to sit out
    tripped: Mutex<HashMap<Topic, u32>>,
}

impl InMemoryOutboxCircuitBreaker {
    pub const DEFAULT_COOLDOWN_COUNT: u32 = 1;

    pub fn new(cooldown_count: u32) -> Self {
        Self {
            cooldown_count,
            tripped: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryOutboxCircuitBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COOLDOWN_COUNT)
    }
}

impl OutboxCircuitBreaker for InMemoryOutboxCircuitBreaker {
    fn cool_down(&self) {
        let mut tripped = self.tripped.lock().unwrap_or_else(PoisonError::into_inner);
        tripped.retain(|topic, remaining| {
            if *remaining == 0 {
                info!(topic = %topic, "topic cooled down");
                return false;
            }
            *remaining -= 1;
            true
        });
    }

    fn trip_topic(&self, topic: &Topic) {
        warn!(topic = %topic, cooldown = self.cooldown_count, "tripping topic");
        self.tripped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.clone(), self.cooldown_count);
    }

    fn tripped_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .tripped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }
}
