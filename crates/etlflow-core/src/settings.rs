//! Explicit run configuration handed to nodes.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings shared by the nodes of one pipeline run.
///
/// Nothing here is process-global: a pipeline builder passes the same
/// value to each node through [`Node::configure`](crate::Node::configure).
///
/// # Example YAML Configuration
///
/// ```yaml
/// bounded_capacity: 64
/// batch_size: 500
/// max_cache_size: 10000
/// progress_every: 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Capacity of every node's input buffer; `None` leaves buffers unbounded.
    #[serde(default)]
    pub bounded_capacity: Option<usize>,

    /// Rows per batch for batch-oriented nodes that were not given their own size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound for bounded memory caches.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Emit a progress log line every N rows a node processes.
    #[serde(default)]
    pub progress_every: Option<u64>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_cache_size() -> usize {
    10_000
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            bounded_capacity: None,
            batch_size: default_batch_size(),
            max_cache_size: default_max_cache_size(),
            progress_every: None,
        }
    }
}

impl FlowSettings {
    pub fn from_yaml(yaml: &str) -> FlowResult<Self> {
        let settings: FlowSettings =
            serde_yaml::from_str(yaml).map_err(|e| FlowError::Other(e.into()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let yaml = std::fs::read_to_string(path.as_ref()).map_err(|e| FlowError::Other(e.into()))?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> FlowResult<()> {
        let node = arcstr::literal!("settings");
        if self.batch_size == 0 {
            return Err(FlowError::config(&node, "batch_size must be at least 1"));
        }
        if self.bounded_capacity == Some(0) {
            return Err(FlowError::config(&node, "bounded_capacity must be at least 1"));
        }
        if self.max_cache_size == 0 {
            return Err(FlowError::config(&node, "max_cache_size must be at least 1"));
        }
        if self.progress_every == Some(0) {
            return Err(FlowError::config(&node, "progress_every must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let settings = FlowSettings::from_yaml("bounded_capacity: 8\n").unwrap();
        assert_eq!(settings.bounded_capacity, Some(8));
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.max_cache_size, 10_000);
        assert_eq!(settings.progress_every, None);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(FlowSettings::from_yaml("batch_size: 0\n").is_err());
        assert!(FlowSettings::from_yaml("bounded_capacity: 0\n").is_err());
    }
}
