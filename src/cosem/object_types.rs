use std::collections::HashMap;

use lazy_static::lazy_static;

use super::{CosemObject, CosemValue};
use crate::obis_utils::ObisId;

/// Format of a single parenthesized field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Octet,
    Integer,
    Decimal,
    Timestamp,
    Obis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CosemObjectType {
    P1VersionOutput,
    P1Timestamp,
    EmeterEquipmentIdentifier,
    EmeterDeliveryTariff1,
    EmeterDeliveryTariff2,
    EmeterProductionTariff1,
    EmeterProductionTariff2,
    EmeterTariffIndicator,
    EmeterActualDelivery,
    EmeterActualProduction,
    EmeterActualThreshold,
    EmeterSwitchPosition,
    EmeterPowerFailures,
    EmeterLongPowerFailures,
    EmeterPowerFailureLog,
    EmeterVoltageSagsL1,
    EmeterVoltageSagsL2,
    EmeterVoltageSagsL3,
    EmeterVoltageSwellsL1,
    EmeterVoltageSwellsL2,
    EmeterVoltageSwellsL3,
    EmeterInstantVoltageL1,
    EmeterInstantVoltageL2,
    EmeterInstantVoltageL3,
    EmeterInstantCurrentL1,
    EmeterInstantCurrentL2,
    EmeterInstantCurrentL3,
    EmeterInstantPowerDeliveryL1,
    EmeterInstantPowerDeliveryL2,
    EmeterInstantPowerDeliveryL3,
    EmeterInstantPowerProductionL1,
    EmeterInstantPowerProductionL2,
    EmeterInstantPowerProductionL3,
    EmeterTextCode,
    EmeterTextString,
    MbusDeviceType,
    MbusEquipmentIdentifier,
    MbusValue,
    MbusValueLegacy,
    MbusValvePosition,
}

/// Catalogue entry: where a record lives and how its fields look
pub struct ObjectSpec {
    pub object_type: CosemObjectType,
    /// OBIS identifier, for channel bound objects with the channel group set to 0
    pub obis: &'static str,
    pub channel_bound: bool,
    pub fields: &'static [ValueKind],
    /// Group that may follow the fixed fields any number of times
    pub repeat: &'static [ValueKind],
    pub extract: fn(&CosemObject) -> Option<CosemValue>,
}

impl ObjectSpec {
    /// Field kinds for a record with `count` fields, `None` if the count doesn't fit the layout
    pub fn layout_for(&self, count: usize) -> Option<Vec<ValueKind>> {
        if self.repeat.is_empty() {
            return (count == self.fields.len()).then(|| self.fields.to_vec());
        }

        if count < self.fields.len() || (count - self.fields.len()) % self.repeat.len() != 0 {
            return None;
        }

        let mut layout = self.fields.to_vec();
        while layout.len() < count {
            layout.extend_from_slice(self.repeat);
        }
        Some(layout)
    }
}

impl CosemObjectType {
    pub fn spec(&self) -> &'static ObjectSpec {
        SPECS_BY_TYPE[self]
    }
}

fn first_value(obj: &CosemObject) -> Option<CosemValue> {
    obj.values.first().cloned()
}

fn second_value(obj: &CosemObject) -> Option<CosemValue> {
    obj.values.get(1).cloned()
}

fn last_value(obj: &CosemObject) -> Option<CosemValue> {
    obj.values.last().cloned()
}

/* Summarises the final entry of the power failure log */
fn power_failure_summary(obj: &CosemObject) -> Option<CosemValue> {
    if obj.values.len() < 4 {
        return Some(CosemValue::Text("No failures".to_string()));
    }

    let end = &obj.values[obj.values.len() - 2];
    let duration = &obj.values[obj.values.len() - 1];
    match (end, duration.as_integer()) {
        (CosemValue::Timestamp { time, .. }, Some(seconds)) => Some(CosemValue::Text(format!(
            "{}, {} seconds",
            time.format("%-d %b %Y %H:%M:%S"),
            seconds
        ))),
        _ => None,
    }
}

use ValueKind::*;

const TEXT: &[ValueKind] = &[Text];
const OCTET: &[ValueKind] = &[Octet];
const INTEGER: &[ValueKind] = &[Integer];
const DECIMAL: &[ValueKind] = &[Decimal];

macro_rules! spec {
    ($t:ident, $obis:expr, $fields:expr) => {
        spec!($t, $obis, false, $fields, &[], first_value)
    };
    ($t:ident, $obis:expr, $bound:expr, $fields:expr, $repeat:expr, $extract:expr) => {
        ObjectSpec {
            object_type: CosemObjectType::$t,
            obis: $obis,
            channel_bound: $bound,
            fields: $fields,
            repeat: $repeat,
            extract: $extract,
        }
    };
}

pub static OBJECT_SPECS: &[ObjectSpec] = &[
    spec!(P1VersionOutput, "1-3:0.2.8", TEXT),
    spec!(P1Timestamp, "0-0:1.0.0", &[Timestamp]),
    spec!(EmeterEquipmentIdentifier, "0-0:96.1.1", OCTET),
    spec!(EmeterDeliveryTariff1, "1-0:1.8.1", DECIMAL),
    spec!(EmeterDeliveryTariff2, "1-0:1.8.2", DECIMAL),
    spec!(EmeterProductionTariff1, "1-0:2.8.1", DECIMAL),
    spec!(EmeterProductionTariff2, "1-0:2.8.2", DECIMAL),
    spec!(EmeterTariffIndicator, "0-0:96.14.0", TEXT),
    spec!(EmeterActualDelivery, "1-0:1.7.0", DECIMAL),
    spec!(EmeterActualProduction, "1-0:2.7.0", DECIMAL),
    spec!(EmeterActualThreshold, "0-0:17.0.0", DECIMAL),
    spec!(EmeterSwitchPosition, "0-0:96.3.10", INTEGER),
    spec!(EmeterPowerFailures, "0-0:96.7.21", INTEGER),
    spec!(EmeterLongPowerFailures, "0-0:96.7.9", INTEGER),
    spec!(EmeterPowerFailureLog, "1-0:99.97.0", false, &[Integer, Obis], &[Timestamp, Integer], power_failure_summary),
    spec!(EmeterVoltageSagsL1, "1-0:32.32.0", INTEGER),
    spec!(EmeterVoltageSagsL2, "1-0:52.32.0", INTEGER),
    spec!(EmeterVoltageSagsL3, "1-0:72.32.0", INTEGER),
    spec!(EmeterVoltageSwellsL1, "1-0:32.36.0", INTEGER),
    spec!(EmeterVoltageSwellsL2, "1-0:52.36.0", INTEGER),
    spec!(EmeterVoltageSwellsL3, "1-0:72.36.0", INTEGER),
    spec!(EmeterInstantVoltageL1, "1-0:32.7.0", DECIMAL),
    spec!(EmeterInstantVoltageL2, "1-0:52.7.0", DECIMAL),
    spec!(EmeterInstantVoltageL3, "1-0:72.7.0", DECIMAL),
    spec!(EmeterInstantCurrentL1, "1-0:31.7.0", DECIMAL),
    spec!(EmeterInstantCurrentL2, "1-0:51.7.0", DECIMAL),
    spec!(EmeterInstantCurrentL3, "1-0:71.7.0", DECIMAL),
    spec!(EmeterInstantPowerDeliveryL1, "1-0:21.7.0", DECIMAL),
    spec!(EmeterInstantPowerDeliveryL2, "1-0:41.7.0", DECIMAL),
    spec!(EmeterInstantPowerDeliveryL3, "1-0:61.7.0", DECIMAL),
    spec!(EmeterInstantPowerProductionL1, "1-0:22.7.0", DECIMAL),
    spec!(EmeterInstantPowerProductionL2, "1-0:42.7.0", DECIMAL),
    spec!(EmeterInstantPowerProductionL3, "1-0:62.7.0", DECIMAL),
    spec!(EmeterTextCode, "0-0:96.13.1", OCTET),
    spec!(EmeterTextString, "0-0:96.13.0", OCTET),
    spec!(MbusDeviceType, "0-0:24.1.0", true, INTEGER, &[], first_value),
    spec!(MbusEquipmentIdentifier, "0-0:96.1.0", true, OCTET, &[], first_value),
    spec!(MbusValue, "0-0:24.2.1", true, &[Timestamp, Decimal], &[], second_value),
    spec!(MbusValueLegacy, "0-0:24.3.0", true, &[Timestamp, Integer, Integer, Integer, Obis, Text, Decimal], &[], last_value),
    spec!(MbusValvePosition, "0-0:24.4.0", true, INTEGER, &[], first_value),
];

lazy_static! {
    static ref SPECS_BY_TYPE: HashMap<CosemObjectType, &'static ObjectSpec> =
        OBJECT_SPECS.iter().map(|s| (s.object_type, s)).collect();

    static ref FIXED_SPECS: HashMap<ObisId, &'static ObjectSpec> = OBJECT_SPECS
        .iter()
        .filter(|s| !s.channel_bound)
        .filter_map(|s| ObisId::parse(s.obis).map(|id| (id, s)))
        .collect();

    static ref MBUS_SPECS: HashMap<ObisId, &'static ObjectSpec> = OBJECT_SPECS
        .iter()
        .filter(|s| s.channel_bound)
        .filter_map(|s| ObisId::parse(s.obis).map(|id| (id, s)))
        .collect();
}

/// Finds the catalogue entry for an identifier together with its M-Bus channel
pub fn lookup(obis: &ObisId) -> Option<(&'static ObjectSpec, Option<u8>)> {
    if let Some(spec) = FIXED_SPECS.get(obis) {
        return Some((*spec, None));
    }

    if obis.channel != 0 {
        if let Some(spec) = MBUS_SPECS.get(&obis.without_channel()) {
            return Some((*spec, Some(obis.channel)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_has_a_spec() {
        assert_eq!(SPECS_BY_TYPE.len(), OBJECT_SPECS.len());
        for spec in OBJECT_SPECS {
            assert!(ObisId::parse(spec.obis).is_some(), "invalid obis {}", spec.obis);
        }
    }

    #[test]
    fn test_lookup_channel() {
        let (spec, channel) = lookup(&ObisId::parse("0-3:96.1.0").unwrap()).unwrap();
        assert_eq!(spec.object_type, CosemObjectType::MbusEquipmentIdentifier);
        assert_eq!(channel, Some(3));

        let (spec, channel) = lookup(&ObisId::parse("1-0:2.7.0").unwrap()).unwrap();
        assert_eq!(spec.object_type, CosemObjectType::EmeterActualProduction);
        assert_eq!(channel, None);

        assert!(lookup(&ObisId::parse("0-0:96.1.0").unwrap()).is_none());
    }

    #[test]
    fn test_layout_with_repeating_group() {
        let spec = CosemObjectType::EmeterPowerFailureLog.spec();
        assert_eq!(spec.layout_for(2).map(|l| l.len()), Some(2));
        assert_eq!(spec.layout_for(6).map(|l| l.len()), Some(6));
        assert!(spec.layout_for(5).is_none());
        assert!(CosemObjectType::EmeterDeliveryTariff1.spec().layout_for(2).is_none());
    }
}
