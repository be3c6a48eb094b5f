use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortSettingsError {
    #[error("Invalid port settings `{0}`, expected e.g. `115200 8N1`")]
    InvalidFormat(String),
    #[error("Unsupported {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }
}

/// Immutable serial line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl PortSettings {
    /// DSMR 4 and later
    pub const HIGH_SPEED: PortSettings = PortSettings {
        baud_rate: 115_200,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    };

    /// DSMR 2.x and 3
    pub const LOW_SPEED: PortSettings = PortSettings {
        baud_rate: 9_600,
        data_bits: 7,
        stop_bits: 1,
        parity: Parity::Even,
    };

    pub fn validate(&self) -> Result<(), PortSettingsError> {
        if self.baud_rate == 0 {
            return Err(PortSettingsError::Unsupported(format!("baud rate {}", self.baud_rate)));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(PortSettingsError::Unsupported(format!("data bits {}", self.data_bits)));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(PortSettingsError::Unsupported(format!("stop bits {}", self.stop_bits)));
        }
        Ok(())
    }

    /// The other standard setting, used while auto detecting the line speed
    pub fn toggled(&self) -> PortSettings {
        if *self == PortSettings::HIGH_SPEED {
            PortSettings::LOW_SPEED
        } else {
            PortSettings::HIGH_SPEED
        }
    }
}

lazy_static! {
    static ref SETTINGS_REGEX: Regex = Regex::new(r"^\s*(\d+)\s+([5-8])([NOEMSnoems])([12])\s*$").unwrap();
}

impl FromStr for PortSettings {
    type Err = PortSettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = SETTINGS_REGEX
            .captures(s)
            .ok_or_else(|| PortSettingsError::InvalidFormat(s.to_string()))?;

        let baud_rate = caps[1]
            .parse::<u32>()
            .map_err(|_| PortSettingsError::InvalidFormat(s.to_string()))?;
        let parity = match caps[3].to_ascii_uppercase().as_str() {
            "N" => Parity::None,
            "O" => Parity::Odd,
            "E" => Parity::Even,
            "M" => Parity::Mark,
            _ => Parity::Space,
        };

        let settings = PortSettings {
            baud_rate,
            data_bits: caps[2].parse().map_err(|_| PortSettingsError::InvalidFormat(s.to_string()))?,
            stop_bits: caps[4].parse().map_err(|_| PortSettingsError::InvalidFormat(s.to_string()))?,
            parity,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl fmt::Display for PortSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}{}{}", self.baud_rate, self.data_bits, self.parity.letter(), self.stop_bits)
    }
}
