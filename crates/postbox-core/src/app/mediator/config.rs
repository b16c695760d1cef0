//! Mediator configuration.
//!
//! Config files write durations as integer milliseconds (`*_ms` keys) and
//! accept `-1` for an unlimited outstanding backlog.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::domain::Args;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// `None` = unlimited.
    #[serde(deserialize_with = "outstanding_limit")]
    pub max_outstanding_messages: Option<usize>,

    /// Minimum time between two outstanding-count refreshes.
    #[serde(
        rename = "max_outstanding_check_interval_ms",
        deserialize_with = "millis"
    )]
    pub max_outstanding_check_interval: Duration,

    /// Passed to every store write.
    #[serde(rename = "outbox_timeout_ms", deserialize_with = "millis")]
    pub outbox_timeout: Duration,

    pub archive_batch_size: usize,

    /// Args for the outstanding-count query.
    pub outstanding_args: Args,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: None,
            max_outstanding_check_interval: Duration::from_secs(1),
            outbox_timeout: Duration::from_millis(300),
            archive_batch_size: 100,
            outstanding_args: Args::new(),
        }
    }
}

pub(crate) fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn outstanding_limit<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|limit| usize::try_from(limit).ok()))
}
