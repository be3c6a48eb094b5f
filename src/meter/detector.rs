use std::collections::BTreeMap;

use log::debug;

use super::{MeterDescriptor, MeterKind};
use crate::cosem::{CosemObject, CosemObjectType, CosemValue};

/// Infers meters from records no registered meter handled
pub struct MeterDetector;

impl MeterDetector {
    pub fn detect_meters(records: &[CosemObject]) -> Vec<MeterDescriptor> {
        let mut detected = Vec::new();

        if find(records, CosemObjectType::P1VersionOutput, None).is_some() {
            detected.push(MeterDescriptor::new(MeterKind::Device, None));
        }

        if find(records, CosemObjectType::EmeterDeliveryTariff1, None).is_some() {
            let mut descriptor = MeterDescriptor::new(MeterKind::Electricity, None);
            descriptor.identifier = identifier(records, CosemObjectType::EmeterEquipmentIdentifier, None);
            detected.push(descriptor);
        }

        let mut channels: BTreeMap<u8, &CosemObject> = BTreeMap::new();
        for record in records {
            if let (Some(channel), CosemObjectType::MbusValue | CosemObjectType::MbusValueLegacy) =
                (record.channel, record.object_type)
            {
                channels.entry(channel).or_insert(record);
            }
        }

        for (channel, value) in channels {
            let Some(kind) = mbus_kind(records, channel, value) else {
                debug!("Unable to determine the meter kind on channel {}", channel);
                continue;
            };

            let mut descriptor = MeterDescriptor::new(kind, Some(channel));
            descriptor.identifier = identifier(records, CosemObjectType::MbusEquipmentIdentifier, Some(channel));
            detected.push(descriptor);
        }

        detected
    }
}

fn find(records: &[CosemObject], object_type: CosemObjectType, channel: Option<u8>) -> Option<&CosemObject> {
    records.iter().find(|r| r.object_type == object_type && r.channel == channel)
}

fn identifier(records: &[CosemObject], object_type: CosemObjectType, channel: Option<u8>) -> Option<String> {
    match find(records, object_type, channel)?.primary_value()? {
        CosemValue::Text(text) if !text.is_empty() => Some(text),
        _ => None,
    }
}

/* The device type record is authoritative, the unit of the reading is the fallback */
fn mbus_kind(records: &[CosemObject], channel: u8, value: &CosemObject) -> Option<MeterKind> {
    let device_type = find(records, CosemObjectType::MbusDeviceType, Some(channel))
        .and_then(|r| r.value(0))
        .and_then(|v| v.as_integer());

    match device_type {
        Some(2) => return Some(MeterKind::SlaveElectricity),
        Some(3) => return Some(MeterKind::Gas),
        Some(4) => return Some(MeterKind::Heating),
        Some(5) | Some(6) => return Some(MeterKind::Cooling),
        Some(7) | Some(8) => return Some(MeterKind::Water),
        Some(other) => debug!("Unknown M-Bus device type {} on channel {}", other, channel),
        None => {}
    }

    let unit = match value.object_type {
        CosemObjectType::MbusValueLegacy => match value.value(5) {
            Some(CosemValue::Text(unit)) => Some(unit.clone()),
            _ => None,
        },
        _ => value.primary_value().and_then(|v| v.unit().map(str::to_string)),
    };

    match unit.as_deref() {
        Some("m3") => Some(MeterKind::Gas),
        Some("GJ") => Some(MeterKind::Heating),
        Some("kWh") => Some(MeterKind::SlaveElectricity),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosem::decode_line;

    fn records(lines: &[&str]) -> Vec<CosemObject> {
        lines.iter().map(|l| decode_line(l).unwrap().unwrap()).collect()
    }

    #[test]
    fn test_detect_full_telegram() {
        let detected = MeterDetector::detect_meters(&records(&[
            "1-3:0.2.8(50)",
            "0-0:96.1.1(4B384547303034303436333935353037)",
            "1-0:1.8.1(123456.789*kWh)",
            "0-1:24.1.0(003)",
            "0-1:96.1.0(3232323241424344313233343536373839)",
            "0-1:24.2.1(101209112500W)(12785.123*m3)",
            "0-2:24.1.0(007)",
            "0-2:24.2.1(101209112500W)(00012.123*m3)",
        ]));

        assert_eq!(
            detected,
            vec![
                MeterDescriptor::new(MeterKind::Device, None),
                MeterDescriptor::new(MeterKind::Electricity, None),
                MeterDescriptor::new(MeterKind::Gas, Some(1)),
                MeterDescriptor::new(MeterKind::Water, Some(2)),
            ]
        );
        assert_eq!(detected[1].identifier.as_deref(), Some("K8EG004046395507"));
        assert_eq!(detected[2].identifier.as_deref(), Some("2222ABCD123456789"));
        assert_eq!(detected[3].identifier, None);
    }

    #[test]
    fn test_detect_by_unit() {
        let detected = MeterDetector::detect_meters(&records(&[
            "0-3:24.2.1(101209112500W)(00001.500*GJ)",
            "0-4:24.3.0(090212160000)(00)(60)(1)(0-4:24.2.1)(m3)(00001.001)",
            "0-1:24.2.1(101209112500W)(00001.500*l)",
        ]));

        assert_eq!(
            detected,
            vec![
                MeterDescriptor::new(MeterKind::Heating, Some(3)),
                MeterDescriptor::new(MeterKind::Gas, Some(4)),
            ]
        );
    }

    #[test]
    fn test_nothing_to_detect() {
        assert!(MeterDetector::detect_meters(&records(&["1-0:1.7.0(01.193*kW)", "0-1:24.1.0(003)"])).is_empty());
    }
}
