//! Machine configuration.
//!
//! Parsed from JSON by the host; every field has a default so an empty
//! object (`{}`) describes a stock NTSC machine with 4 MiB of RDRAM.

use lockstep_core::logging::{LogConfig, LogLevel};
use lockstep_core::OpenBus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU clock (93.75 MHz)
pub const CPU_HZ: u64 = 93_750_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown log level: {0}")]
    LogLevel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Region {
    #[default]
    Ntsc,
    Pal,
}

impl Region {
    /// Fields per second
    pub fn refresh_hz(self) -> u64 {
        match self {
            Region::Ntsc => 60,
            Region::Pal => 50,
        }
    }

    /// Lines per field
    pub fn lines_per_field(self) -> u32 {
        match self {
            Region::Ntsc => 262,
            Region::Pal => 312,
        }
    }

    /// CPU cycles per scan line
    pub fn cycles_per_line(self) -> u32 {
        (CPU_HZ / self.refresh_hz() / u64::from(self.lines_per_field())) as u32
    }

    /// VI/AI DAC reference clock
    pub fn video_clock_hz(self) -> u64 {
        match self {
            Region::Ntsc => 48_681_812,
            Region::Pal => 49_656_530,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RdramSize {
    #[default]
    FourMiB,
    EightMiB,
}

impl RdramSize {
    pub fn bytes(self) -> usize {
        match self {
            RdramSize::FourMiB => 4 * 1024 * 1024,
            RdramSize::EightMiB => 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub rdram_size: RdramSize,
    #[serde(default)]
    pub open_bus: OpenBus,
    /// Global log level ("off", "error", "warn", "info", "debug", "trace")
    #[serde(default)]
    pub log_level: Option<String>,
}

impl SystemConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Push `log_level` into the global logger
    pub fn apply_logging(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.log_level {
            let level =
                LogLevel::from_str(name).ok_or_else(|| ConfigError::LogLevel(name.clone()))?;
            LogConfig::global().set_global_level(level);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = SystemConfig::from_json("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.region, Region::Ntsc);
        assert_eq!(config.rdram_size.bytes(), 4 * 1024 * 1024);
        assert_eq!(config.open_bus, OpenBus::LastDriven { initial: 0 });
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SystemConfig {
            region: Region::Pal,
            rdram_size: RdramSize::EightMiB,
            open_bus: OpenBus::Fixed(0xDEAD_BEEF),
            log_level: None,
        };
        let json = config.to_json().unwrap();
        assert_eq!(SystemConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SystemConfig::from_json("{\"region\": \"Secam\"}"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_log_level() {
        let config = SystemConfig {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.apply_logging(),
            Err(ConfigError::LogLevel(_))
        ));
    }

    #[test]
    fn test_region_timing() {
        assert_eq!(Region::Ntsc.cycles_per_line(), 5963);
        assert_eq!(Region::Pal.cycles_per_line(), 6009);
    }
}
