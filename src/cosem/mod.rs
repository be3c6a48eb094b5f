use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use thiserror::Error;

use crate::obis_utils::{self, ObisId};

pub mod object_types;

pub use object_types::{CosemObjectType, ObjectSpec, ValueKind};

/// Errors raised while decoding the fields of a known record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CosemError {
    #[error("Invalid record format `{0}`")]
    InvalidFormat(String),
    #[error("Unexpected number of fields ({1}) for {0}")]
    FieldCount(String, usize),
    #[error("Invalid {kind:?} value `{value}` for {obis}")]
    InvalidValue {
        obis: String,
        kind: ValueKind,
        value: String,
    },
}

/// A single typed value of a record
#[derive(Debug, Clone, PartialEq)]
pub enum CosemValue {
    Text(String),
    Integer { value: i64, unit: Option<String> },
    Decimal { value: f64, unit: Option<String> },
    Timestamp { time: NaiveDateTime, summer_time: Option<bool> },
    Obis(String),
}

impl fmt::Display for CosemValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CosemValue::Text(text) => write!(f, "{}", text),
            CosemValue::Integer { value, unit: Some(unit) } => write!(f, "{} {}", value, unit),
            CosemValue::Integer { value, unit: None } => write!(f, "{}", value),
            CosemValue::Decimal { value, unit: Some(unit) } => write!(f, "{} {}", value, unit),
            CosemValue::Decimal { value, unit: None } => write!(f, "{}", value),
            CosemValue::Timestamp { time, .. } => write!(f, "{}", time.format("%Y-%m-%d %H:%M:%S")),
            CosemValue::Obis(code) => write!(f, "{}", code),
        }
    }
}

impl CosemValue {
    pub fn unit(&self) -> Option<&str> {
        match self {
            CosemValue::Integer { unit, .. } | CosemValue::Decimal { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CosemValue::Integer { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// One decoded data line of a telegram
#[derive(Debug, Clone, PartialEq)]
pub struct CosemObject {
    pub object_type: CosemObjectType,
    pub obis: ObisId,
    /// M-Bus channel, only set for channel bound objects
    pub channel: Option<u8>,
    pub values: Vec<CosemValue>,
}

impl CosemObject {
    pub fn value(&self, index: usize) -> Option<&CosemValue> {
        self.values.get(index)
    }

    /// The value a consumer normally wants from this record
    pub fn primary_value(&self) -> Option<CosemValue> {
        (self.object_type.spec().extract)(self)
    }
}

impl fmt::Display for CosemObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self.object_type, self.obis)?;
        for value in &self.values {
            write!(f, "({})", value)?;
        }
        Ok(())
    }
}

lazy_static! {
    static ref FIELDS_REGEX: Regex = Regex::new(r"^(?:\([^()]*\))+$").unwrap();
    static ref FIELD_REGEX: Regex = Regex::new(r"\(([^()]*)\)").unwrap();
}

/// Decodes a complete (possibly joined) record line.
///
/// Returns `Ok(None)` for lines with an identifier that is not in the catalogue, those are
/// skipped silently. Lines with a known identifier but unusable fields return an error.
pub fn decode_line(line: &str) -> Result<Option<CosemObject>, CosemError> {
    let line = line.trim();
    let Some(paren_start) = line.find('(') else {
        debug!("Ignoring line without value fields: {}", line);
        return Ok(None);
    };

    let obis_code = obis_utils::normalize_obis_code(&line[..paren_start]);
    let Some(obis) = ObisId::parse(&obis_code) else {
        debug!("Ignoring line with unknown identifier: {}", line);
        return Ok(None);
    };

    let Some((spec, channel)) = object_types::lookup(&obis) else {
        debug!("Ignoring unsupported object {}", obis);
        return Ok(None);
    };

    let fields_part = &line[paren_start..];
    if !FIELDS_REGEX.is_match(fields_part) {
        return Err(CosemError::InvalidFormat(line.to_string()));
    }

    let raw_fields: Vec<&str> = FIELD_REGEX
        .captures_iter(fields_part)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    decode_object(spec, obis, channel, &raw_fields).map(Some)
}

fn decode_object(spec: &ObjectSpec, obis: ObisId, channel: Option<u8>, raw_fields: &[&str]) -> Result<CosemObject, CosemError> {
    let kinds = spec.layout_for(raw_fields.len())
        .ok_or_else(|| CosemError::FieldCount(obis.to_string(), raw_fields.len()))?;

    let mut values = Vec::with_capacity(raw_fields.len());
    for (raw, kind) in raw_fields.iter().zip(kinds) {
        values.push(parse_value(&obis, kind, raw)?);
    }

    Ok(CosemObject {
        object_type: spec.object_type,
        obis,
        channel,
        values,
    })
}

fn parse_value(obis: &ObisId, kind: ValueKind, raw: &str) -> Result<CosemValue, CosemError> {
    let invalid = || CosemError::InvalidValue {
        obis: obis.to_string(),
        kind,
        value: raw.to_string(),
    };

    match kind {
        ValueKind::Text => Ok(CosemValue::Text(raw.to_string())),
        ValueKind::Octet => Ok(CosemValue::Text(decode_octet_string(raw))),
        ValueKind::Integer => {
            let (number, unit) = split_unit(raw);
            let value = number.parse::<i64>().map_err(|_| invalid())?;
            Ok(CosemValue::Integer { value, unit })
        }
        ValueKind::Decimal => {
            let (number, unit) = split_unit(raw);
            let value = number.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(invalid)?;
            Ok(CosemValue::Decimal { value, unit })
        }
        ValueKind::Timestamp => parse_timestamp(raw).ok_or_else(invalid),
        ValueKind::Obis => {
            if obis_utils::validate_obis_code(raw) {
                Ok(CosemValue::Obis(raw.to_string()))
            } else {
                Err(invalid())
            }
        }
    }
}

fn split_unit(raw: &str) -> (&str, Option<String>) {
    match raw.find('*') {
        Some(star_pos) => (&raw[..star_pos], obis_utils::extract_unit(raw)),
        None => (raw, None),
    }
}

/* YYMMDDhhmmss followed by S (summer) or W (winter), the letter is missing on old meters */
fn parse_timestamp(raw: &str) -> Option<CosemValue> {
    let (digits, summer_time) = match raw.chars().last()? {
        'S' => (&raw[..raw.len() - 1], Some(true)),
        'W' => (&raw[..raw.len() - 1], Some(false)),
        _ => (raw, None),
    };

    if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let part = |i: usize| digits[i..i + 2].parse::<u32>().ok();
    let time = NaiveDate::from_ymd_opt(2000 + part(0)? as i32, part(2)?, part(4)?)?
        .and_hms_opt(part(6)?, part(8)?, part(10)?)?;

    Some(CosemValue::Timestamp { time, summer_time })
}

/* Identifiers and messages are sent hex encoded, keep the raw text when it isn't */
fn decode_octet_string(raw: &str) -> String {
    if raw.len() % 2 != 0 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return raw.to_string();
    }

    let decoded: Option<Vec<u8>> = (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect();

    match decoded {
        Some(bytes) if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') => {
            String::from_utf8(bytes).unwrap_or_else(|_| raw.to_string())
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_decimal_record() {
        let obj = decode_line("1-0:1.8.1(012345.678*kWh)").unwrap().unwrap();
        assert_eq!(obj.object_type, CosemObjectType::EmeterDeliveryTariff1);
        assert_eq!(obj.channel, None);
        assert_eq!(obj.values, vec![CosemValue::Decimal { value: 12345.678, unit: Some("kWh".to_string()) }]);
    }

    #[test]
    fn test_decode_mbus_record() {
        let obj = decode_line("0-2:24.2.1(101209112500W)(12785.123*m3)").unwrap().unwrap();
        assert_eq!(obj.object_type, CosemObjectType::MbusValue);
        assert_eq!(obj.channel, Some(2));
        assert_eq!(obj.primary_value(), Some(CosemValue::Decimal { value: 12785.123, unit: Some("m3".to_string()) }));
        match obj.value(0) {
            Some(CosemValue::Timestamp { time, summer_time }) => {
                assert_eq!(time.to_string(), "2010-12-09 11:25:00");
                assert_eq!(*summer_time, Some(false));
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_gas_record() {
        let obj = decode_line("0-1:24.3.0(090212160000)(00)(60)(1)(0-1:24.2.1)(m3)(00001.001)").unwrap().unwrap();
        assert_eq!(obj.object_type, CosemObjectType::MbusValueLegacy);
        assert_eq!(obj.values.len(), 7);
        assert_eq!(obj.primary_value(), Some(CosemValue::Decimal { value: 1.001, unit: None }));
    }

    #[test]
    fn test_decode_power_failure_log() {
        let obj = decode_line("1-0:99.97.0(2)(0-0:96.7.19)(101208152415W)(0000000240*s)(101208151004W)(0000000301*s)")
            .unwrap()
            .unwrap();
        assert_eq!(obj.values.len(), 6);
        assert_eq!(obj.primary_value(), Some(CosemValue::Text("8 Dec 2010 15:10:04, 301 seconds".to_string())));

        let empty = decode_line("1-0:99.97.0(0)(0-0:96.7.19)").unwrap().unwrap();
        assert_eq!(empty.primary_value(), Some(CosemValue::Text("No failures".to_string())));
    }

    #[test]
    fn test_decode_octet_string() {
        let obj = decode_line("0-0:96.1.1(4B384547303034303436333935353037)").unwrap().unwrap();
        assert_eq!(obj.values, vec![CosemValue::Text("K8EG004046395507".to_string())]);
    }

    #[test]
    fn test_unknown_line_is_ignored() {
        assert_eq!(decode_line("0-0:99.99.99(42)"), Ok(None));
        assert_eq!(decode_line("garbage"), Ok(None));
    }

    #[test]
    fn test_malformed_known_record() {
        assert!(matches!(decode_line("1-0:1.8.1(abc*kWh)"), Err(CosemError::InvalidValue { .. })));
        assert!(matches!(decode_line("1-0:1.8.1(1.0*kWh)(2.0*kWh)"), Err(CosemError::FieldCount(_, 2))));
        assert!(matches!(decode_line("1-0:1.8.1(1.0*kWh"), Err(CosemError::InvalidFormat(_))));
    }

    #[test]
    fn test_non_finite_decimal_is_rejected() {
        for raw in ["NaN", "nan", "inf", "-inf", "infinity"] {
            let line = format!("1-0:1.8.1({}*kWh)", raw);
            assert!(matches!(decode_line(&line), Err(CosemError::InvalidValue { .. })), "{} was accepted", raw);
        }
        assert!(decode_line("1-0:1.8.1(-0.5*kWh)").unwrap().is_some());
    }
}
