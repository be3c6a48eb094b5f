use crc16::{State, ARC};
use log::debug;

use super::{structs::TelegramHeader, P1TelegramError};

pub fn parse_identification_line(line: &str) -> Result<TelegramHeader, P1TelegramError> {
    // Example formats:
    // /ISk5\2MT382-1000
    // /KFM5KAIFA-METER
    // /XMX5LGBBFFB231215493

    let content = line.strip_prefix('/').ok_or(P1TelegramError::MissingIdentification)?;

    // Manufacturer is the first 3 characters, the baud rate character follows
    if content.len() < 4 || !content.is_char_boundary(3) {
        return Err(P1TelegramError::InvalidIdentification(line.to_string()));
    }

    let manufacturer = content[..3].to_string();
    let identification = content[3..].trim().to_string();

    debug!("Parsed identification - Manufacturer: {}, ID: {}", manufacturer, identification);

    Ok(TelegramHeader {
        manufacturer,
        identification,
    })
}

/// CRC16/ARC over the telegram from `/` up to and including `!`
pub fn calculate_checksum(data: &[u8]) -> u16 {
    State::<ARC>::calculate(data)
}

/// Compares a calculated checksum with the four hex digits sent after `!`
pub fn checksum_matches(calculated: u16, provided_checksum: &str) -> bool {
    match u16::from_str_radix(provided_checksum, 16) {
        Ok(provided) => provided_checksum.len() == 4 && calculated == provided,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identification_line() {
        let header = parse_identification_line("/ISk5\\2MT382-1000").unwrap();
        assert_eq!(header.manufacturer, "ISk");
        assert_eq!(header.identification, "5\\2MT382-1000");

        assert!(matches!(parse_identification_line("ISk5"), Err(P1TelegramError::MissingIdentification)));
        assert!(matches!(parse_identification_line("/IS"), Err(P1TelegramError::InvalidIdentification(_))));
    }

    #[test]
    fn test_checksum() {
        // CRC16/ARC check value
        assert_eq!(calculate_checksum(b"123456789"), 0xBB3D);
        let calculated = calculate_checksum(b"123456789");
        assert!(checksum_matches(calculated, "BB3D"));
        assert!(checksum_matches(calculated, "bb3d"));
        assert!(!checksum_matches(calculated, "BB3E"));
        assert!(!checksum_matches(calculated, "XYZ1"));
        assert!(!checksum_matches(0xBB3D, "0BB3D"));
        assert!(checksum_matches(0x00FF, "00ff"));
    }
}
