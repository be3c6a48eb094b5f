use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, Weak};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cosem::{CosemObject, CosemObjectType, CosemValue};

pub mod detector;

pub use detector::MeterDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// The P1 interface itself
    Device,
    Electricity,
    Gas,
    Water,
    Heating,
    Cooling,
    /// Electricity meter attached to the M-Bus
    SlaveElectricity,
}

impl MeterKind {
    pub fn is_mbus(&self) -> bool {
        !matches!(self, MeterKind::Device | MeterKind::Electricity)
    }

    pub fn supports(&self, object_type: CosemObjectType) -> bool {
        use CosemObjectType::*;

        let mbus = matches!(
            object_type,
            MbusDeviceType | MbusEquipmentIdentifier | MbusValue | MbusValueLegacy | MbusValvePosition
        );

        match self {
            MeterKind::Device => matches!(object_type, P1VersionOutput | P1Timestamp | EmeterTextCode | EmeterTextString),
            MeterKind::Electricity => !mbus && !MeterKind::Device.supports(object_type),
            _ => mbus,
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MeterKind::Device => "device",
            MeterKind::Electricity => "electricity",
            MeterKind::Gas => "gas",
            MeterKind::Water => "water",
            MeterKind::Heating => "heating",
            MeterKind::Cooling => "cooling",
            MeterKind::SlaveElectricity => "slave_electricity",
        };
        write!(f, "{}", name)
    }
}

/// Identifies a logical meter on the P1 line, equal when kind and channel match
#[derive(Debug, Clone)]
pub struct MeterDescriptor {
    pub kind: MeterKind,
    pub channel: Option<u8>,
    pub identifier: Option<String>,
}

impl MeterDescriptor {
    pub fn new(kind: MeterKind, channel: Option<u8>) -> Self {
        Self {
            kind,
            channel,
            identifier: None,
        }
    }
}

impl PartialEq for MeterDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.channel == other.channel
    }
}

impl Eq for MeterDescriptor {}

impl Hash for MeterDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.channel.hash(state);
    }
}

impl fmt::Display for MeterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(channel) = self.channel {
            write!(f, " (channel {})", channel)?;
        }
        if let Some(identifier) = &self.identifier {
            write!(f, " [{}]", identifier)?;
        }
        Ok(())
    }
}

/// Something that takes records out of a telegram batch
pub trait MeterConsumer: Send + Sync {
    fn descriptor(&self) -> &MeterDescriptor;

    /// Handles the records this consumer is responsible for and returns them
    fn handle_records(&self, records: &[CosemObject]) -> Vec<CosemObject>;
}

pub trait MeterValueListener: Send + Sync {
    fn meter_value(&self, descriptor: &MeterDescriptor, record: &CosemObject, value: &CosemValue);
}

impl<F> MeterValueListener for F
where
    F: Fn(&MeterDescriptor, &CosemObject, &CosemValue) + Send + Sync,
{
    fn meter_value(&self, descriptor: &MeterDescriptor, record: &CosemObject, value: &CosemValue) {
        self(descriptor, record, value)
    }
}

/// Decides about meters found in unclaimed records, returns whether the meter is accepted
pub trait MeterDiscoveryListener: Send + Sync {
    fn meter_discovered(&self, descriptor: &MeterDescriptor) -> bool;
}

impl<F> MeterDiscoveryListener for F
where
    F: Fn(&MeterDescriptor) -> bool + Send + Sync,
{
    fn meter_discovered(&self, descriptor: &MeterDescriptor) -> bool {
        self(descriptor)
    }
}

/// Standard consumer, forwards the primary value of every claimed record
pub struct DsmrMeter {
    descriptor: MeterDescriptor,
    listener: Arc<dyn MeterValueListener>,
}

impl DsmrMeter {
    pub fn new(descriptor: MeterDescriptor, listener: Arc<dyn MeterValueListener>) -> Self {
        Self { descriptor, listener }
    }
}

impl MeterConsumer for DsmrMeter {
    fn descriptor(&self) -> &MeterDescriptor {
        &self.descriptor
    }

    fn handle_records(&self, records: &[CosemObject]) -> Vec<CosemObject> {
        let claimed: Vec<CosemObject> = records
            .iter()
            .filter(|r| r.channel == self.descriptor.channel && self.descriptor.kind.supports(r.object_type))
            .cloned()
            .collect();

        for record in &claimed {
            match record.primary_value() {
                Some(value) => self.listener.meter_value(&self.descriptor, record, &value),
                None => debug!("No value in {} for {}", record, self.descriptor),
            }
        }
        claimed
    }
}

/// Routes telegram batches to the registered meters, the registry doesn't keep meters alive
pub struct MeterDispatcher {
    meters: RwLock<Vec<Weak<dyn MeterConsumer>>>,
    discovery_listener: Option<Arc<dyn MeterDiscoveryListener>>,
}

impl MeterDispatcher {
    pub fn new(discovery_listener: Option<Arc<dyn MeterDiscoveryListener>>) -> Self {
        Self {
            meters: RwLock::new(Vec::new()),
            discovery_listener,
        }
    }

    pub fn add_meter(&self, meter: &Arc<dyn MeterConsumer>) {
        let mut meters = self.meters.write().unwrap_or_else(|e| e.into_inner());
        if meters.iter().any(|m| m.upgrade().is_some_and(|m| Arc::ptr_eq(&m, meter))) {
            debug!("Meter {} is already registered", meter.descriptor());
            return;
        }
        info!("Adding meter {}", meter.descriptor());
        meters.push(Arc::downgrade(meter));
    }

    pub fn remove_meter(&self, meter: &Arc<dyn MeterConsumer>) {
        let mut meters = self.meters.write().unwrap_or_else(|e| e.into_inner());
        meters.retain(|m| m.upgrade().is_some_and(|m| !Arc::ptr_eq(&m, meter)));
        info!("Removed meter {}", meter.descriptor());
    }

    pub fn meter_count(&self) -> usize {
        let meters = self.meters.read().unwrap_or_else(|e| e.into_inner());
        meters.iter().filter(|m| m.strong_count() > 0).count()
    }

    /// Offers the batch to every meter in registration order, leftovers go to meter detection.
    /// Returns the descriptors detected in the leftovers.
    pub fn dispatch(&self, mut records: Vec<CosemObject>) -> Vec<MeterDescriptor> {
        let meters: Vec<Arc<dyn MeterConsumer>> = {
            let mut registry = self.meters.write().unwrap_or_else(|e| e.into_inner());
            registry.retain(|m| m.strong_count() > 0);
            registry.iter().filter_map(|m| m.upgrade()).collect()
        };

        for meter in meters {
            if records.is_empty() {
                break;
            }
            debug!("Processing records for meter {}", meter.descriptor());
            let claimed = meter.handle_records(&records);
            debug!("Meter {} claimed {} records", meter.descriptor(), claimed.len());
            records.retain(|r| !claimed.contains(r));
        }

        if records.is_empty() {
            return Vec::new();
        }

        info!("There are {} unhandled records, start detecting meters", records.len());
        let detected = MeterDetector::detect_meters(&records);
        if detected.is_empty() {
            debug!("No new meters in unhandled records");
            return detected;
        }
        info!("Detected the following new meters: {:?}", detected.iter().map(|d| d.to_string()).collect::<Vec<_>>());

        match &self.discovery_listener {
            Some(listener) => {
                for descriptor in &detected {
                    if !listener.meter_discovered(descriptor) {
                        info!("Discovery listener rejected meter {}", descriptor);
                    }
                }
            }
            None => warn!("There is no listener for new meters!"),
        }
        detected
    }
}
