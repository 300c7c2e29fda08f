//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A required value is missing or invalid
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Upstream live-stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Bilibili live room identifier
    #[serde(default)]
    pub room_id: String,
    /// Stream quality passed to the fetcher (default "best")
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_quality() -> String {
    "best".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            quality: default_quality(),
        }
    }
}

impl StreamConfig {
    /// The live-stream URL handed to the fetcher
    pub fn url(&self) -> String {
        format!("https://live.bilibili.com/{}", self.room_id)
    }
}

/// Local HTTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// Loopback port the relay server binds to (default 8765)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8765
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl HttpConfig {
    /// The URL handed to the playback client
    pub fn audio_url(&self) -> String {
        format!("http://127.0.0.1:{}/audio.aac", self.port)
    }
}

/// Transcoder output parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// AAC bitrate in kbit/s (default 128)
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Output sample rate in Hz (default 44100)
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
}

fn default_bitrate_kbps() -> u32 {
    128
}

fn default_sample_rate_hz() -> u32 {
    44_100
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: default_bitrate_kbps(),
            sample_rate_hz: default_sample_rate_hz(),
        }
    }
}

/// Relay timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayTimingConfig {
    /// Warmup duration: seconds of transcoder output buffered before serving (default 2)
    #[serde(default = "default_preload_secs")]
    pub preload_secs: u64,
    /// Grace period between terminate and force-kill during shutdown (default 2)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Monitor loop polling interval in milliseconds (default 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_preload_secs() -> u64 {
    2
}

fn default_grace_period_secs() -> u64 {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for RelayTimingConfig {
    fn default() -> Self {
        Self {
            preload_secs: default_preload_secs(),
            grace_period_secs: default_grace_period_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Explicit paths to the external tools, overriding search-based resolution
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolsConfig {
    /// Path to the stream fetcher (streamlink)
    #[serde(default)]
    pub fetcher: Option<PathBuf>,
    /// Path to the transcoder (ffmpeg)
    #[serde(default)]
    pub transcoder: Option<PathBuf>,
    /// Path to the playback client
    #[serde(default)]
    pub player: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub relay: RelayTimingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAY_ROOM_ID -> stream.room_id
    /// - RELAY_QUALITY -> stream.quality
    /// - RELAY_HTTP_PORT -> http.port
    /// - RELAY_PRELOAD_SECS -> relay.preload_secs
    /// - RELAY_GRACE_PERIOD_SECS -> relay.grace_period_secs
    /// - AUDIO_BITRATE_KBPS -> audio.bitrate_kbps
    /// - AUDIO_SAMPLE_RATE_HZ -> audio.sample_rate_hz
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_ROOM_ID") {
            if !val.is_empty() {
                self.stream.room_id = val;
            }
        }

        if let Ok(val) = env::var("RELAY_QUALITY") {
            if !val.is_empty() {
                self.stream.quality = val;
            }
        }

        if let Ok(val) = env::var("RELAY_HTTP_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.http.port = port;
            }
        }

        if let Ok(val) = env::var("RELAY_PRELOAD_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.relay.preload_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_GRACE_PERIOD_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.relay.grace_period_secs = secs;
            }
        }

        if let Ok(val) = env::var("AUDIO_BITRATE_KBPS") {
            if let Ok(kbps) = val.parse::<u32>() {
                self.audio.bitrate_kbps = kbps;
            }
        }

        if let Ok(val) = env::var("AUDIO_SAMPLE_RATE_HZ") {
            if let Ok(hz) = val.parse::<u32>() {
                self.audio.sample_rate_hz = hz;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Validate values that have no usable default
    ///
    /// An empty room id means the fetcher has no stream to pull; this must be
    /// reported before any child process is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "stream.room_id is empty; set it in config.toml, RELAY_ROOM_ID, or --room"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
