//! DSMR P1 smart meter library
//!
//! This library reads telegrams from the P1 port of a smart meter, keeps the serial
//! connection alive and hands the decoded records to the meters registered for them.

pub mod config;
pub mod obis_utils;
pub mod cosem;
pub mod p1telegram;
pub mod device;
pub mod meter;

// Re-export common types for easier access
pub use config::{Config, ConfigError, DeviceConfig, MeterConfig};
pub use cosem::{CosemObject, CosemObjectType, CosemValue};
pub use device::{DeviceState, DeviceStateListener, DsmrDevice, NativeSerialConnector, PortSettings};
pub use meter::{DsmrMeter, MeterConsumer, MeterDescriptor, MeterDispatcher, MeterKind};
pub use p1telegram::{P1TelegramParser, Telegram, TelegramState};
