//! Client configuration
//!
//! Stored as TOML under the platform config directory. Every field has a
//! default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::channel::AUDIO_QUEUE_CAPACITY;
use crate::audio::playback::Concealment;
use crate::codec::decoder::SUPPORTED_SAMPLE_RATES;
use crate::error::{Error, Result};
use crate::network::session::{SessionConfig, CONTACT_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::protocol::Compression;

const CONFIG_FILE_NAME: &str = "client.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionTimingConfig,
}

/// Where the server lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server IP address
    pub address: String,
    /// Server port for control datagrams
    pub port: u16,
    /// Local port the server streams to
    pub local_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "192.168.1.2".to_string(),
            port: crate::constants::DEFAULT_SERVER_PORT,
            local_port: crate::constants::DEFAULT_LOCAL_PORT,
        }
    }
}

/// Stream format and playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration of one packet in microseconds
    pub packet_duration_us: u32,
    /// Format requested from the server
    pub compression: Compression,
    /// Output device name, default device when unset
    pub output_device: Option<String>,
    pub concealment: Concealment,
    /// Capacity of each inbound audio queue, in packets
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            packet_duration_us: crate::constants::DEFAULT_PACKET_DURATION_US,
            compression: Compression::default(),
            output_device: None,
            concealment: Concealment::default(),
            queue_capacity: AUDIO_QUEUE_CAPACITY,
        }
    }
}

/// Keepalive timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimingConfig {
    pub keepalive_interval_ms: u64,
    pub contact_timeout_ms: u64,
}

impl Default for SessionTimingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: KEEPALIVE_INTERVAL.as_millis() as u64,
            contact_timeout_ms: CONTACT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl From<&SessionTimingConfig> for SessionConfig {
    fn from(timing: &SessionTimingConfig) -> Self {
        SessionConfig {
            keepalive_interval: Duration::from_millis(timing.keepalive_interval_ms),
            contact_timeout: Duration::from_millis(timing.contact_timeout_ms),
        }
    }
}

impl ClientConfig {
    /// Platform config location, e.g. `~/.config/remote-audio-client/client.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "remote-audio-client")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, using defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write the config as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check values the rest of the client relies on.
    pub fn validate(&self) -> Result<()> {
        self.server_ip()?;

        if self.server.local_port == 0 {
            return Err(Error::Config("server.local_port must be non-zero".into()));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "audio.sample_rate {} is not one of {:?}",
                self.audio.sample_rate, SUPPORTED_SAMPLE_RATES
            )));
        }
        if !matches!(self.audio.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        let duration = self.audio.packet_duration_us;
        if !(2_500..=60_000).contains(&duration) || duration % 2_500 != 0 {
            return Err(Error::Config(format!(
                "audio.packet_duration_us {} must be 2500..=60000 in steps of 2500",
                duration
            )));
        }
        if self.audio.queue_capacity == 0 {
            return Err(Error::Config("audio.queue_capacity must be non-zero".into()));
        }
        if self.session.keepalive_interval_ms == 0 {
            return Err(Error::Config(
                "session.keepalive_interval_ms must be non-zero".into(),
            ));
        }
        if self.session.contact_timeout_ms < self.session.keepalive_interval_ms {
            return Err(Error::Config(
                "session.contact_timeout_ms must not be shorter than the keepalive interval"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Parsed server address
    pub fn server_ip(&self) -> Result<IpAddr> {
        self.server.address.parse().map_err(|_| {
            Error::Config(format!("server.address {:?} is not an IP address", self.server.address))
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.session)
    }
}
