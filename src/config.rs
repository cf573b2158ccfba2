use crate::error::CamlinkError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which transport the sender uses to reach us. Fixed for the lifetime of
/// one pipeline; switching requires rebuilding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtmp,
    Srt,
    WebRtc,
}

impl Protocol {
    /// Default listening port for each transport.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Rtmp => 2935,
            Protocol::Srt => 9000,
            Protocol::WebRtc => 8080,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Rtmp => write!(f, "rtmp"),
            Protocol::Srt => write!(f, "srt"),
            Protocol::WebRtc => write!(f, "webrtc"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CamlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtmp" => Ok(Protocol::Rtmp),
            "srt" => Ok(Protocol::Srt),
            "webrtc" => Ok(Protocol::WebRtc),
            other => Err(CamlinkError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Runtime configuration, read once at pipeline construction and treated as
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: Protocol,
    /// Listening port; 0 means "use the protocol default".
    pub port: u16,
    /// Stream path, only meaningful for RTMP.
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// No frame for this long while connected is treated as a connection
    /// loss.
    pub stale_frame_timeout_secs: u64,
    /// Explicit path to the ffmpeg binary; when absent it is looked up on
    /// PATH.
    pub ffmpeg_bin: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            protocol: Protocol::Rtmp,
            port: 0,
            path: "live/stream".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            stale_frame_timeout_secs: 5,
            ffmpeg_bin: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults; an unreadable or malformed file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Effective listening port after applying the protocol default.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.protocol.default_port()
        } else {
            self.port
        }
    }

    pub fn stale_frame_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_frame_timeout_secs)
    }

    /// Resolved ffmpeg binary: the explicit override when set, otherwise
    /// whatever PATH yields.
    pub fn ffmpeg(&self) -> Option<PathBuf> {
        self.ffmpeg_bin.clone().or_else(|| FFMPEG_ON_PATH.clone())
    }

    pub fn validate(&self) -> Result<(), CamlinkError> {
        if self.max_reconnect_attempts == 0 {
            return Err(CamlinkError::InvalidConfig(
                "max_reconnect_attempts must be positive".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CamlinkError::InvalidConfig(format!(
                "invalid frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(CamlinkError::InvalidConfig("fps must be positive".into()));
        }
        if self.stale_frame_timeout_secs == 0 {
            return Err(CamlinkError::InvalidConfig(
                "stale_frame_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// ffmpeg as found on PATH, resolved once per process.
static FFMPEG_ON_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in ["ffmpeg", "ffmpeg.exe"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
});

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_defaults_and_parsing() {
        assert_eq!(Protocol::Rtmp.default_port(), 2935);
        assert_eq!(Protocol::Srt.default_port(), 9000);
        assert_eq!(Protocol::WebRtc.default_port(), 8080);

        assert_eq!("RTMP".parse::<Protocol>().unwrap(), Protocol::Rtmp);
        assert_eq!("webrtc".parse::<Protocol>().unwrap(), Protocol::WebRtc);
        assert!("quic".parse::<Protocol>().is_err());
    }

    #[test]
    fn effective_port_falls_back_to_protocol_default() {
        let mut config = Config::default();
        assert_eq!(config.effective_port(), 2935);

        config.protocol = Protocol::Srt;
        assert_eq!(config.effective_port(), 9000);

        config.port = 12000;
        assert_eq!(config.effective_port(), 12000);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.protocol = Protocol::WebRtc;
        config.auto_reconnect = false;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.protocol, Protocol::WebRtc);
        assert!(!parsed.auto_reconnect);
        assert_eq!(parsed.path, "live/stream");
    }

    #[test]
    fn partial_json_uses_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"protocol":"srt"}"#).unwrap();
        assert_eq!(parsed.protocol, Protocol::Srt);
        assert_eq!(parsed.width, 1280);
        assert!(parsed.auto_reconnect);
    }
}
