//! Application configuration
//!
//! One TOML file holds the settings of the relay server and of both client
//! roles. Missing keys take their defaults, so a partial file is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::EnhancerConfig;
use crate::constants::*;
use crate::diagnostics::QualityThresholds;
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Seconds between WebSocket pings
    pub heartbeat_secs: u64,
    /// Missed heartbeat intervals before a connection is dropped
    pub heartbeat_misses: u32,
    /// Outbound messages queued per connection
    pub outbound_queue: usize,
    /// Pending commands kept per offline device
    pub command_capacity: usize,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            heartbeat_misses: HEARTBEAT_MISSES,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind address: {}", e)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Silence after which a connection is considered half-open
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_misses.max(1)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Settings shared by listener and producer clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the relay, e.g. `ws://host:3000/ws`
    pub server_url: String,
    /// Fixed device id; a persisted generated id is used when unset
    pub device_id: Option<String>,
    /// Producer device a listener subscribes to
    pub target_device_id: Option<String>,
    /// Reconnect with exponential backoff after the connection drops
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Seconds between application-level pings
    pub ping_interval_secs: u64,
    pub input_device: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}{}", DEFAULT_SERVER_PORT, WS_PATH),
            device_id: None,
            target_device_id: None,
            reconnect: true,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 10_000,
            ping_interval_secs: 5,
            input_device: None,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// Listener playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Jitter buffer capacity in frames
    pub capacity: usize,
    /// Frames buffered before playback starts
    pub min_fill: usize,
    pub output_device: Option<String>,
    pub metrics_tick_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_JITTER_CAPACITY,
            min_fill: DEFAULT_MIN_FILL_FRAMES,
            output_device: None,
            metrics_tick_ms: METRICS_TICK_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn metrics_tick(&self) -> Duration {
        Duration::from_millis(self.metrics_tick_ms.max(100))
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub playback: PlaybackConfig,
    pub enhancer: EnhancerConfig,
    pub quality: QualityThresholds,
}

impl AppConfig {
    /// Platform directories for this application
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "audio-relay")
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        Self::project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FilterMode, VolumeMode};

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.socket_addr().unwrap().port(), 3000);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(75));
        assert_eq!(config.playback.capacity, 100);
        assert_eq!(config.playback.min_fill, 8);
        assert_eq!(config.quality.excellent_ms, 2500);
        assert_eq!(config.client.server_url, "ws://127.0.0.1:3000/ws");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 4100

            [enhancer]
            filter_mode = "voice"
            gain_boost_db = 40.0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.heartbeat_secs, 25);
        assert_eq!(config.enhancer.filter_mode, FilterMode::Voice);
        assert_eq!(config.enhancer.volume_mode, VolumeMode::Normal);
        assert_eq!(config.enhancer.gain_boost_db(), 12.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.client.device_id = Some("dev-1".to_string());
        config.playback.min_fill = 4;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "server = 5").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_bind_address() {
        let server = ServerConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(matches!(server.socket_addr(), Err(Error::Config(_))));
    }
}
