//! Cached outstanding-message count.
//!
//! Counting the outstanding set is an expensive store query, so the mediator
//! keeps the last result in an atomic and refreshes it in the background:
//! - at most once per `interval` (the slot is claimed when scheduling)
//! - single-flight: overlapping background refreshes collapse into one
//! - a failed query resets the count to zero so adds are not blocked

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::gate::{Gate, GatePermit};
use crate::domain::{Args, RequestContext};
use crate::ports::clock::to_time_delta;
use crate::ports::{Clock, OutboxAsync, OutboxSync, StoreError};

pub(crate) struct OutstandingTracker {
    count: AtomicUsize,
    last_check: Mutex<DateTime<Utc>>,
    interval: Duration,
    gate: Gate,
    clock: Arc<dyn Clock>,
    args: Args,
}

impl OutstandingTracker {
    pub(crate) fn new(clock: Arc<dyn Clock>, interval: Duration, args: Args) -> Self {
        Self {
            count: AtomicUsize::new(0),
            last_check: Mutex::new(clock.now()),
            interval,
            gate: Gate::new("outstanding-count"),
            clock,
            args,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Claim the next refresh slot. `false` while the interval since the
    /// last claimed slot has not elapsed.
    pub(crate) fn claim_slot(&self) -> bool {
        let now = self.clock.now();
        let mut last_check = self
            .last_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let since_last = now - *last_check;
        if since_last < to_time_delta(self.interval) {
            debug!(
                since_last_ms = since_last.num_milliseconds(),
                "outstanding check not ready to run yet"
            );
            return false;
        }
        *last_check = now;
        debug!(
            since_last_ms = since_last.num_milliseconds(),
            "running outstanding message check"
        );
        true
    }

    pub(crate) fn try_enter(&self) -> Option<GatePermit> {
        self.gate.try_enter()
    }

    pub(crate) async fn enter(&self) -> Option<GatePermit> {
        self.gate.enter().await.ok()
    }

    pub(crate) fn enter_blocking(&self) -> Option<GatePermit> {
        self.gate.enter_blocking().ok()
    }

    /// Query the store and update the cached count. Caller holds the gate.
    pub(crate) fn refresh_blocking<Tx>(
        &self,
        store: &dyn OutboxSync<Tx>,
        ctx: &RequestContext,
        _permit: &GatePermit,
    ) -> usize {
        debug!("begin count of outstanding messages");
        let result = store.outstanding_count(Duration::ZERO, ctx, &[], &self.args);
        self.apply(result)
    }

    pub(crate) async fn refresh_async<Tx: Sync>(
        &self,
        store: &dyn OutboxAsync<Tx>,
        ctx: &RequestContext,
        _permit: &GatePermit,
    ) -> usize {
        debug!("begin count of outstanding messages");
        let result = store
            .outstanding_count(Duration::ZERO, ctx, &[], &self.args)
            .await;
        self.apply(result)
    }

    fn apply(&self, result: Result<usize, StoreError>) -> usize {
        let count = match result {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "error getting outstanding message count, reset count");
                0
            }
        };
        self.count.store(count, Ordering::Release);
        debug!(outstanding = count, "current outstanding count");
        count
    }
}
