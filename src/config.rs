//! Configuration loading and validation.

use crate::error::Result;
use anyhow::Context as _;
use std::path::PathBuf;
use std::time::Duration;

/// Core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file path.
    pub db_path: PathBuf,

    /// Vector store configuration. `None` disables semantic retrieval;
    /// read paths degrade to text search.
    pub vector: Option<VectorConfig>,

    /// Event bus settings.
    pub events: EventConfig,

    /// Deadline applied to every public facade operation. `None` means
    /// operations run unbounded.
    pub op_timeout: Option<Duration>,

    /// When enabled, the hybrid read path records per-layer latencies.
    pub profiling: bool,

    /// Register unknown senders on first message instead of failing
    /// with NotFound.
    pub auto_register_senders: bool,
}

/// Vector store configuration.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// LanceDB directory or remote URL.
    pub uri: String,

    /// Optional credentials for remote stores.
    pub api_key: Option<String>,
}

/// Event bus configuration.
#[derive(Debug, Clone, Copy)]
pub struct EventConfig {
    /// Ring buffer capacity: the number of most recent events retained
    /// for replay.
    pub ring_capacity: usize,

    /// Per-subscriber live queue limit before the subscriber is
    /// disconnected with a resync signal.
    pub subscriber_queue: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 10_000,
            subscriber_queue: 1_024,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Recognized knobs: `CLAUDE_SLACK_DB`, `CLAUDE_SLACK_VECTOR_URI`,
    /// `CLAUDE_SLACK_VECTOR_API_KEY`, `CLAUDE_SLACK_EVENT_RING`,
    /// `CLAUDE_SLACK_OP_TIMEOUT_MS`, `CLAUDE_SLACK_PROFILING`,
    /// `CLAUDE_SLACK_AUTO_REGISTER`.
    pub fn load() -> Result<Self> {
        let db_path = std::env::var("CLAUDE_SLACK_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/claude-slack.db"));

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
        }

        let vector = std::env::var("CLAUDE_SLACK_VECTOR_URI")
            .ok()
            .map(|uri| VectorConfig {
                uri,
                api_key: std::env::var("CLAUDE_SLACK_VECTOR_API_KEY").ok(),
            });

        let mut events = EventConfig::default();
        if let Ok(value) = std::env::var("CLAUDE_SLACK_EVENT_RING") {
            events.ring_capacity = value
                .parse()
                .with_context(|| format!("invalid CLAUDE_SLACK_EVENT_RING value: {value}"))?;
        }

        let op_timeout = match std::env::var("CLAUDE_SLACK_OP_TIMEOUT_MS") {
            Ok(value) => {
                let millis: u64 = value
                    .parse()
                    .with_context(|| format!("invalid CLAUDE_SLACK_OP_TIMEOUT_MS value: {value}"))?;
                Some(Duration::from_millis(millis))
            }
            Err(_) => None,
        };

        Ok(Self {
            db_path,
            vector,
            events,
            op_timeout,
            profiling: env_flag("CLAUDE_SLACK_PROFILING"),
            auto_register_senders: env_flag("CLAUDE_SLACK_AUTO_REGISTER"),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/claude-slack.db"),
            vector: None,
            events: EventConfig::default(),
            op_timeout: None,
            profiling: false,
            auto_register_senders: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
