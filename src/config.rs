use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ClientError;

/// Client configuration. All fields have defaults so an empty TOML file
/// (or none at all) yields a working local setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket control channel endpoint
    pub control_url: String,
    /// WHIP endpoint for the media channel (None disables WebRTC media)
    pub whip_url: Option<String>,
    /// STUN servers for ICE
    pub ice_servers: Vec<String>,
    /// Input device name (None for default)
    pub input_device: Option<String>,
    /// Output device name (None for default)
    pub output_device: Option<String>,
    /// Application-level heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Deadline for the WebSocket dial in seconds
    pub connect_timeout_secs: u64,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Backoff base delay in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds
    pub backoff_cap_ms: u64,
    /// Playback release / watchdog tick in milliseconds
    pub release_tick_ms: u64,
    /// Network stats refresh interval in seconds
    pub stats_interval_secs: u64,
    /// Apply the DC-block + gain enhancement to captured frames
    pub capture_enhancement: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_url: "ws://localhost:8080/ws".to_string(),
            whip_url: None,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
            input_device: None,
            output_device: None,
            heartbeat_interval_secs: 25,
            connect_timeout_secs: 15,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30000,
            release_tick_ms: 100,
            stats_interval_secs: 2,
            capture_enhancement: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: ClientConfig = toml::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if !self.control_url.starts_with("ws://") && !self.control_url.starts_with("wss://") {
            return Err(ClientError::Config(format!(
                "control_url must be a ws:// or wss:// URL, got '{}'",
                self.control_url
            )));
        }
        if self.backoff_base_ms == 0 {
            return Err(ClientError::Config("backoff_base_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn release_tick(&self) -> Duration {
        Duration::from_millis(self.release_tick_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
