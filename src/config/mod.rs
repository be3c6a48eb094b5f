use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::device::structs::{RECOVERY_TIMEOUT, SERIAL_PORT_AUTO_DETECT_TIMEOUT};
use crate::meter::MeterKind;

const CONFIG_PATHS: [&str; 2] = ["config/dsmr.yaml", "dsmr.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("No config found on config/dsmr.yaml or dsmr.yaml")]
    NotFound,
    #[error("Meter {0} refers to unknown device {1}")]
    UnknownDevice(String, String),
    #[error("M-Bus meter {0} on device {1} needs a channel")]
    MissingChannel(String, String),
}

fn lenient_mode_default() -> bool { return false }
fn recovery_timeout_default() -> u64 { return RECOVERY_TIMEOUT.as_secs() }
fn auto_detect_timeout_default() -> u64 { return SERIAL_PORT_AUTO_DETECT_TIMEOUT.as_secs() }
fn watchdog_period_default() -> u64 { return 30 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub serial_port: String,
    /* e.g. "115200 8N1", disables the speed detection when set */
    pub serial_port_settings: Option<String>,
    #[serde(default="lenient_mode_default")]
    pub lenient_mode: bool,
    #[serde(default="recovery_timeout_default")]
    pub recovery_timeout: u64,      // Seconds
    #[serde(default="auto_detect_timeout_default")]
    pub auto_detect_timeout: u64,   // Seconds
    #[serde(default="watchdog_period_default")]
    pub watchdog_period: u64,       // Seconds
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    pub device: String,
    pub kind: MeterKind,
    pub channel: Option<u8>,
}

fn devices_default() -> Vec<DeviceConfig> { return Vec::new(); }
fn meters_default() -> Vec<MeterConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="devices_default")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());

        let mut file = File::open(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        Self::parse(&contents)
    }

    /// Tries config/dsmr.yaml first and dsmr.yaml after that
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in CONFIG_PATHS {
            let path = Path::new(path);
            if path.exists() {
                info!("Using config {}", path.display());
                return Self::load(path);
            }
        }
        Err(ConfigError::NotFound)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;

        /* Meters must belong to a configured device */
        for meter in &config.meters {
            if config.device(&meter.device).is_none() {
                return Err(ConfigError::UnknownDevice(meter.kind.to_string(), meter.device.clone()));
            }
            if meter.kind.is_mbus() && meter.channel.is_none() {
                return Err(ConfigError::MissingChannel(meter.kind.to_string(), meter.device.clone()));
            }
        }
        Ok(config)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn meters_of(&self, device: &str) -> impl Iterator<Item = &MeterConfig> {
        let device = device.to_string();
        self.meters.iter().filter(move |m| m.device == device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
devices:
  - name: p1
    serial_port: /dev/ttyUSB0
  - name: legacy
    serial_port: /dev/ttyUSB1
    serial_port_settings: "9600 7E1"
    lenient_mode: true
    recovery_timeout: 60
meters:
  - device: p1
    kind: electricity
  - device: p1
    kind: gas
    channel: 1
"#;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.devices.len(), 2);

        let p1 = config.device("p1").unwrap();
        assert_eq!(p1.serial_port_settings, None);
        assert!(!p1.lenient_mode);
        assert_eq!(p1.recovery_timeout, 30);
        assert_eq!(p1.auto_detect_timeout, 30);
        assert_eq!(p1.watchdog_period, 30);

        let legacy = config.device("legacy").unwrap();
        assert_eq!(legacy.serial_port_settings.as_deref(), Some("9600 7E1"));
        assert!(legacy.lenient_mode);
        assert_eq!(legacy.recovery_timeout, 60);

        let meters: Vec<_> = config.meters_of("p1").collect();
        assert_eq!(meters.len(), 2);
        assert_eq!(meters[1].kind, MeterKind::Gas);
        assert_eq!(meters[1].channel, Some(1));
        assert_eq!(config.meters_of("legacy").count(), 0);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(Config::load(Path::new("/nonexistent/dsmr.yaml")), Err(ConfigError::Io(..))));
        assert!(matches!(Config::parse("devices: 12"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            Config::parse("meters:\n  - device: nope\n    kind: water\n"),
            Err(ConfigError::UnknownDevice(..))
        ));
        assert!(matches!(
            Config::parse("devices:\n  - name: p1\n    serial_port: /dev/ttyUSB0\nmeters:\n  - device: p1\n    kind: gas\n"),
            Err(ConfigError::MissingChannel(..))
        ));
        assert_eq!(Config::parse("{}").unwrap(), Config { devices: Vec::new(), meters: Vec::new() });
    }
}
