//! Runtime configuration: endpoint, credentials, stream defaults, and the
//! coordinator's pacing knobs. Loaded from a TOML file when one is given,
//! with environment overrides for the deploy-specific values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::notifier::RESULT_CHANNEL;
use crate::protocol::SamplingParams;
use crate::scheduler::{FLUSH_LENGTH_THRESHOLD, THROTTLE_WINDOW};

pub const ENDPOINT_ENV: &str = "STREAMFAN_ENDPOINT";
pub const PASSWORD_ENV: &str = "STREAMFAN_PASSWORD";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Completion backend URL.
    pub endpoint: String,
    /// Shared secret forwarded in the request body.
    pub password: String,
    /// Default number of concurrent streams per generation.
    pub stream_count: usize,
    /// Token budget for a fresh generation.
    pub max_tokens: u32,
    /// Larger budget used by continuation runs.
    pub continue_max_tokens: u32,
    pub sampling: SamplingParams,
    /// Characters of accumulated content that force an immediate flush.
    pub flush_threshold: usize,
    /// Batching window for sub-threshold updates, in milliseconds.
    pub throttle_ms: u64,
    /// Broadcast channel name shared with listener contexts.
    pub channel: String,
    /// Snapshot database path shared with other contexts.
    pub store_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: "http://127.0.0.1:8000/completions".to_string(),
            password: String::new(),
            stream_count: 4,
            max_tokens: 500,
            continue_max_tokens: 1000,
            sampling: SamplingParams::default(),
            flush_threshold: FLUSH_LENGTH_THRESHOLD,
            throttle_ms: THROTTLE_WINDOW.as_millis() as u64,
            channel: RESULT_CHANNEL.to_string(),
            store_path: PathBuf::from("streamfan.db"),
        }
    }
}

impl Config {
    /// Read configuration from `path` (defaults when absent or unreadable),
    /// then apply process-environment overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(text) => toml::from_str(&text).unwrap_or_else(|err| {
                    warn!(path = %p.display(), error = %err, "unparseable config, using defaults");
                    Config::default()
                }),
                Err(err) => {
                    warn!(path = %p.display(), error = %err, "unreadable config, using defaults");
                    Config::default()
                }
            },
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply deploy-specific overrides from a key lookup (the environment in
    /// production; injectable for tests).
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = get(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        if let Some(password) = get(PASSWORD_ENV) {
            self.password = password;
        }
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}
