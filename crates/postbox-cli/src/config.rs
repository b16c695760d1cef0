//! Demo configuration: an optional JSON file with command-line overrides.

use std::path::Path;

use anyhow::Context;
use postbox_core::{MediatorConfig, SweeperOptions};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub mediator: MediatorConfig,
    pub sweeper: SweeperOptions,
    /// Topics to register producers for and deposit onto, round robin.
    pub topics: Vec<String>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            mediator: MediatorConfig::default(),
            sweeper: SweeperOptions::default(),
            topics: vec!["orders".to_string(), "invoices".to_string()],
        }
    }
}

impl DemoConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        anyhow::ensure!(!config.topics.is_empty(), "config needs at least one topic");
        Ok(config)
    }
}
