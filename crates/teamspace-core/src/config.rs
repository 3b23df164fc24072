use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Engine configuration that can be loaded from a JSON file.
/// Every field is optional in the file; missing ones take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// How long a written mutation waits for its feed confirmation
    pub confirmation_timeout_ms: u64,

    /// Resubscribe policy after the feed connection drops
    pub reconnect: ReconnectConfig,

    /// Field a kanban card is grouped by
    pub group_field: String,

    /// Payload field carrying an update's correlation key
    pub correlation_field: String,

    /// Longest accepted chat message, in characters
    pub max_message_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// Give up after this many failed reopen attempts (None = retry forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: constants::CONFIRMATION_TIMEOUT_MS,
            reconnect: ReconnectConfig::default(),
            group_field: constants::GROUP_FIELD.to_string(),
            correlation_field: constants::CORRELATION_FIELD.to_string(),
            max_message_length: constants::MAX_MESSAGE_LENGTH,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: constants::RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: constants::RECONNECT_MAX_DELAY_MS,
            multiplier: constants::RECONNECT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

impl SyncConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize sync config")
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

impl ReconnectConfig {
    /// Delay before reopen attempt `attempt` (1-based), capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}
