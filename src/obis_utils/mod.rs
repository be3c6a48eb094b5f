use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

/// OBIS identifier in the reduced `A-B:C.D.E` form used on the P1 port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisId {
    pub medium: u8,
    pub channel: u8,
    pub quantity: u8,
    pub processing: u8,
    pub tariff: u8,
}

impl ObisId {
    pub fn parse(code: &str) -> Option<Self> {
        if !validate_obis_code(code) {
            return None;
        }

        let (ab, cde) = code.split_once(':')?;
        let (a, b) = ab.split_once('-')?;
        let cde = cde.split('*').next().unwrap_or("");
        let mut cde = cde.split('.');

        Some(ObisId {
            medium: a.parse().ok()?,
            channel: b.parse().ok()?,
            quantity: cde.next()?.parse().ok()?,
            processing: cde.next()?.parse().ok()?,
            tariff: cde.next()?.parse().ok()?,
        })
    }

    /* Same identifier with the channel group masked out, used for M-Bus lookups */
    pub fn without_channel(&self) -> ObisId {
        ObisId { channel: 0, ..*self }
    }
}

impl fmt::Display for ObisId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}:{}.{}.{}", self.medium, self.channel, self.quantity, self.processing, self.tariff)
    }
}

lazy_static! {
    static ref DESCRIPTIONS: HashMap<&'static str, &'static str> = get_standard_obis_descriptions();
}

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    if let Some(description) = DESCRIPTIONS.get(obis_code) {
        return Some(description);
    }

    /* M-Bus objects are described once, independent of their channel */
    let id = ObisId::parse(obis_code)?;
    if id.channel != 0 {
        return DESCRIPTIONS.get(id.without_channel().to_string().as_str()).copied();
    }
    None
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Header
    map.insert("1-3:0.2.8", "P1 output version");
    map.insert("0-0:1.0.0", "Date and time");
    map.insert("0-0:96.1.1", "Equipment identifier");

    // Energy values
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");
    map.insert("0-0:96.14.0", "Tariff indicator");

    // Power values
    map.insert("1-0:1.7.0", "Active power + (total)");
    map.insert("1-0:2.7.0", "Active power - (total)");
    map.insert("1-0:21.7.0", "Active power + (L1)");
    map.insert("1-0:41.7.0", "Active power + (L2)");
    map.insert("1-0:61.7.0", "Active power + (L3)");
    map.insert("1-0:22.7.0", "Active power - (L1)");
    map.insert("1-0:42.7.0", "Active power - (L2)");
    map.insert("1-0:62.7.0", "Active power - (L3)");
    map.insert("0-0:17.0.0", "Actual threshold");
    map.insert("0-0:96.3.10", "Switch position");

    // Voltage and current
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    // Power quality
    map.insert("0-0:96.7.21", "Number of power failures");
    map.insert("0-0:96.7.9", "Number of long power failures");
    map.insert("1-0:99.97.0", "Power failure event log");
    map.insert("1-0:32.32.0", "Number of voltage sags (L1)");
    map.insert("1-0:52.32.0", "Number of voltage sags (L2)");
    map.insert("1-0:72.32.0", "Number of voltage sags (L3)");
    map.insert("1-0:32.36.0", "Number of voltage swells (L1)");
    map.insert("1-0:52.36.0", "Number of voltage swells (L2)");
    map.insert("1-0:72.36.0", "Number of voltage swells (L3)");

    // Messages
    map.insert("0-0:96.13.1", "Text message code");
    map.insert("0-0:96.13.0", "Text message");

    // M-Bus devices (channel masked)
    map.insert("0-0:24.1.0", "M-Bus device type");
    map.insert("0-0:96.1.0", "M-Bus equipment identifier");
    map.insert("0-0:24.2.1", "M-Bus meter reading");
    map.insert("0-0:24.3.0", "M-Bus meter reading (legacy)");
    map.insert("0-0:24.4.0", "M-Bus valve position");

    map
}

pub fn validate_obis_code(code: &str) -> bool {
    // OBIS code format: A-B:C.D.E*F
    // A: Medium (0=abstract, 1=electricity, 6=heat, 7=gas, 8=water)
    // B: Channel (0 for the meter itself, 1-4 for M-Bus devices)
    // C: Physical value (1-255)
    // D: Processing method (0-255)
    // E: Tariff/Time (0-255)
    // F: Storage (optional, 0-255)

    let parts: Vec<&str> = code.split(':').collect();
    if parts.len() != 2 {
        return false;
    }

    // Check A-B part
    let ab_parts: Vec<&str> = parts[0].split('-').collect();
    if ab_parts.len() != 2 {
        return false;
    }

    // Check C.D.E part (and optional *F)
    let cde_part = parts[1];
    let cde_parts: Vec<&str> = if cde_part.contains('*') {
        cde_part.split('*').next().unwrap_or("").split('.').collect()
    } else {
        cde_part.split('.').collect()
    };

    if cde_parts.len() != 3 {
        return false;
    }

    // Validate that all parts are numeric
    for part in ab_parts.iter().chain(cde_parts.iter()) {
        if part.parse::<u8>().is_err() {
            return false;
        }
    }

    true
}

pub fn normalize_obis_code(code: &str) -> String {
    code.trim().replace(' ', "")
}

pub fn extract_unit(value_content: &str) -> Option<String> {
    if let Some(star_pos) = value_content.rfind('*') {
        let unit = &value_content[star_pos + 1..];
        if !unit.is_empty() {
            return Some(unit.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_obis_code() {
        assert!(validate_obis_code("1-0:1.8.1"));
        assert!(validate_obis_code("0-1:24.2.1"));
        assert!(validate_obis_code("1-3:0.2.8"));
        assert!(!validate_obis_code("invalid"));
        assert!(!validate_obis_code("1:2.3.4"));
        assert!(!validate_obis_code("1-0:1.8"));
    }

    #[test]
    fn test_parse_obis_id() {
        let id = ObisId::parse("0-2:24.2.1").unwrap();
        assert_eq!(id.medium, 0);
        assert_eq!(id.channel, 2);
        assert_eq!(id.quantity, 24);
        assert_eq!(id.to_string(), "0-2:24.2.1");
        assert_eq!(id.without_channel().to_string(), "0-0:24.2.1");
        assert!(ObisId::parse("0-0:96.1").is_none());
    }

    #[test]
    fn test_get_obis_description() {
        assert_eq!(get_obis_description("1-0:1.8.1"), Some("Active energy + (tariff 1)"));
        assert_eq!(get_obis_description("0-3:24.2.1"), Some("M-Bus meter reading"));
        assert_eq!(get_obis_description("nonexistent"), None);
    }

    #[test]
    fn test_extract_unit() {
        assert_eq!(extract_unit("123.456*kWh"), Some("kWh".to_string()));
        assert_eq!(extract_unit("0000000240*s"), Some("s".to_string()));
        assert_eq!(extract_unit("123456"), None);
        assert_eq!(extract_unit("123*"), None);
    }

    #[test]
    fn test_normalize_obis_code() {
        assert_eq!(normalize_obis_code("  1-0:1.8.1  "), "1-0:1.8.1");
        assert_eq!(normalize_obis_code("1-0: 1.7.0"), "1-0:1.7.0");
    }
}
