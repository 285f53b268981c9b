//! Engine-Konfiguration
//!
//! Alle Felder haben Defaults, eine JSON-Datei muss nur die Abweichungen
//! enthalten. Die Relay-URL kann über `AVCALL_SIGNALING_URL` überschrieben
//! werden.

use crate::call_engine::CameraPosition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Umgebungsvariable für die Relay-URL
pub const SIGNALING_URL_ENV: &str = "AVCALL_SIGNALING_URL";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// BITRATE RANGE
// ============================================================================

/// Erlaubter Bereich der Audio-Bitrate in kbit/s (Opus: 6..=510)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateRange {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

impl BitrateRange {
    pub fn contains(&self, bitrate: u32) -> bool {
        (self.min..=self.max).contains(&bitrate)
    }
}

impl Default for BitrateRange {
    fn default() -> Self {
        Self {
            min: 6,
            max: 510,
            default: 48,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio_bitrate: BitrateRange,

    /// Wiederholungen bei transienten Sendefehlern (nicht für Hangup/Cancel)
    pub control_retries: u32,

    pub retry_delay_ms: u64,

    /// Kapazität des Event-Kanals
    pub event_capacity: usize,

    pub default_camera: CameraPosition,

    /// Relay für den WebSocket-Transport, z.B. `wss://relay.example.org`
    pub signaling_url: Option<String>,

    /// Ablage für Schlüssel und Anrufliste
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio_bitrate: BitrateRange::default(),
            control_retries: 1,
            retry_delay_ms: 200,
            event_capacity: 100,
            default_camera: CameraPosition::Front,
            signaling_url: None,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Lädt eine JSON-Konfiguration und validiert sie
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading config from {:?}", path);

        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Übernimmt die Relay-URL aus der Umgebung, falls gesetzt
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var(SIGNALING_URL_ENV) {
            if !url.trim().is_empty() {
                self.signaling_url = Some(url.trim().to_string());
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = &self.audio_bitrate;
        if range.min == 0 || range.min > range.max {
            return Err(ConfigError::Invalid(format!(
                "audio bitrate range {}..={} is empty or starts at zero",
                range.min, range.max
            )));
        }
        if !range.contains(range.default) {
            return Err(ConfigError::Invalid(format!(
                "default audio bitrate {} outside {}..={}",
                range.default, range.min, range.max
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be > 0".to_string()));
        }
        self.signaling_url()?;
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Geparste Relay-URL; nur ws:// und wss:// sind erlaubt
    pub fn signaling_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(raw) = self.signaling_url.as_deref() else {
            return Ok(None);
        };

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Some(url)),
            other => Err(ConfigError::InvalidUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            ))),
        }
    }

    /// Datenverzeichnis; ohne Angabe das plattformübliche App-Verzeichnis
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }

        directories::ProjectDirs::from("org", "avcall", "avcall")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoDataDir)
    }
}

// ============================================================================
// TESTS
// ============================================================================
