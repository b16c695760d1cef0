//! Ambient per-request context handed to every store and mediator call.

use std::collections::HashMap;

use tracing::Span;

/// Provider-specific arguments (e.g. a topic filter some stores need).
pub type Args = HashMap<String, serde_json::Value>;

/// Tracing handle plus a bag of arguments for one logical request.
///
/// Mediator operations open their spans as children of `span`, so a caller
/// that passes its own span gets the outbox work nested under it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub span: Span,
    pub bag: Args,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            span: Span::current(),
            bag: Args::new(),
        }
    }

    pub fn with_span(span: Span) -> Self {
        Self {
            span,
            bag: Args::new(),
        }
    }

    pub fn with_bag_item(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.bag.insert(key.into(), value);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A page request against a store. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub size: usize,
    pub number: usize,
}

impl Page {
    pub const DEFAULT_SIZE: usize = 100;

    pub fn new(size: usize, number: usize) -> Self {
        Self {
            size,
            number: number.max(1),
        }
    }

    pub fn first(size: usize) -> Self {
        Self::new(size, 1)
    }

    /// Everything in one page.
    pub fn all() -> Self {
        Self::new(usize::MAX, 1)
    }

    /// Number of items to skip before this page.
    pub fn offset(&self) -> usize {
        (self.number - 1).saturating_mul(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_SIZE)
    }
}
