use crc16::{State, ARC};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::cosem::{self, CosemObject};
use crate::obis_utils::{self, ObisId};

pub mod structs;
pub mod utils;

pub use structs::{Telegram, TelegramHeader, TelegramState};

/// Telegrams larger than this are dropped as incomplete
pub const MAX_TELEGRAM_LENGTH: usize = 8192;

#[derive(Error, Debug)]
pub enum P1TelegramError {
    #[error("Missing identification line")]
    MissingIdentification,
    #[error("Invalid identification line `{0}`")]
    InvalidIdentification(String),
}

/// Receives every telegram the parser completes, whatever its state
pub trait TelegramListener: Send {
    fn telegram_received(&mut self, telegram: Telegram);
}

impl<F> TelegramListener for F
where
    F: FnMut(Telegram) + Send,
{
    fn telegram_received(&mut self, telegram: Telegram) {
        self(telegram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    WaitForStart,
    Header,
    Data,
    Crc,
}

/// Streaming P1 telegram parser.
///
/// Bytes can be fed in chunks of any size, the outcome only depends on the byte sequence.
/// A `/` at the start of a line always begins a new telegram, whatever was pending is dropped.
pub struct P1TelegramParser {
    lenient_mode: bool,
    state: ParserState,
    line: Vec<u8>,
    record: String,
    checksum: String,
    header: Option<TelegramHeader>,
    records: Vec<CosemObject>,
    crc: State<ARC>,
    length: usize,
    listener: Box<dyn TelegramListener>,
}

impl P1TelegramParser {
    pub fn new(lenient_mode: bool, listener: Box<dyn TelegramListener>) -> Self {
        Self {
            lenient_mode,
            state: ParserState::WaitForStart,
            line: Vec::new(),
            record: String::new(),
            checksum: String::new(),
            header: None,
            records: Vec::new(),
            crc: State::<ARC>::new(),
            length: 0,
            listener,
        }
    }

    pub fn parse_data(&mut self, data: &[u8]) {
        for &byte in data {
            self.parse_byte(byte);
        }
    }

    /// Drops the telegram in progress without reporting it
    pub fn abort_telegram(&mut self) {
        if self.state != ParserState::WaitForStart {
            debug!("Aborting telegram in progress ({} bytes)", self.length);
        }
        self.reset();
    }

    fn parse_byte(&mut self, byte: u8) {
        match self.state {
            ParserState::WaitForStart => {
                if byte == b'/' {
                    self.start_telegram();
                } else {
                    trace!("Skipping byte 0x{:02X} outside telegram", byte);
                }
            }
            ParserState::Header | ParserState::Data => {
                if byte == b'/' && self.line.is_empty() {
                    debug!("New telegram started, dropping unfinished telegram");
                    self.start_telegram();
                    return;
                }

                if !self.count_byte(byte) {
                    return;
                }

                match byte {
                    b'\n' => self.line_complete(),
                    b'!' if self.state == ParserState::Data && self.line.is_empty() => {
                        if self.flush_record() {
                            self.state = ParserState::Crc;
                        }
                    }
                    _ => self.line.push(byte),
                }
            }
            ParserState::Crc => match byte {
                b'\r' => {}
                b'\n' => self.finish_telegram(),
                b'/' if self.checksum.is_empty() => {
                    debug!("New telegram started before checksum, dropping unfinished telegram");
                    self.start_telegram();
                }
                _ => {
                    if self.count_byte(byte) {
                        self.checksum.push(byte as char);
                    }
                }
            },
        }
    }

    fn start_telegram(&mut self) {
        self.reset();
        self.state = ParserState::Header;
        self.crc.update(b"/");
        self.length = 1;
    }

    /* Returns false when the telegram was dropped for being too long */
    fn count_byte(&mut self, byte: u8) -> bool {
        self.length += 1;
        if self.length > MAX_TELEGRAM_LENGTH {
            warn!("Telegram exceeds {} bytes, dropping it", MAX_TELEGRAM_LENGTH);
            self.emit(TelegramState::Incomplete, Vec::new());
            self.reset();
            return false;
        }

        if self.state != ParserState::Crc {
            self.crc.update(&[byte]);
        }
        true
    }

    fn line_complete(&mut self) {
        let raw = std::mem::take(&mut self.line);
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();

        if self.state == ParserState::Header {
            match utils::parse_identification_line(&format!("/{}", text)) {
                Ok(header) => self.header = Some(header),
                Err(e) => debug!("Unusable telegram header: {}", e),
            }
            self.state = ParserState::Data;
            return;
        }

        if text.is_empty() {
            return;
        }

        /* Values that don't fit on one line continue on the next one, an identifier always starts a new record */
        if !self.record.is_empty()
            && (text.starts_with('(') || (!parens_balanced(&self.record) && !starts_with_identifier(text)))
        {
            self.record.push_str(text);
            return;
        }

        if self.flush_record() {
            self.record = text.to_string();
        }
    }

    /* Decodes the pending record, returns false when the telegram was aborted */
    fn flush_record(&mut self) -> bool {
        if self.record.is_empty() {
            return true;
        }

        let record = std::mem::take(&mut self.record);
        match cosem::decode_line(&record) {
            Ok(Some(object)) => {
                trace!("Decoded {}", object);
                self.records.push(object);
                true
            }
            Ok(None) => true,
            Err(e) if self.lenient_mode => {
                debug!("Dropping malformed record `{}`: {}", record, e);
                true
            }
            Err(e) => {
                warn!("Malformed record `{}`: {}, dropping telegram", record, e);
                self.emit(TelegramState::Incomplete, Vec::new());
                self.reset();
                false
            }
        }
    }

    fn finish_telegram(&mut self) {
        let checksum = std::mem::take(&mut self.checksum);
        let checksum = checksum.trim();

        let state = if checksum.is_empty() {
            debug!("Telegram without checksum");
            TelegramState::Ok
        } else {
            let calculated = self.crc.get();
            if utils::checksum_matches(calculated, checksum) {
                TelegramState::Ok
            } else {
                warn!("Checksum mismatch, telegram has {} calculated {:04X}", checksum, calculated);
                TelegramState::Invalid
            }
        };

        let records = std::mem::take(&mut self.records);
        let records = if state == TelegramState::Ok || self.lenient_mode {
            records
        } else {
            Vec::new()
        };

        self.emit(state, records);
        self.reset();
    }

    fn emit(&mut self, state: TelegramState, records: Vec<CosemObject>) {
        debug!("{} ({} records)", state.details(), records.len());
        let telegram = Telegram {
            header: self.header.take(),
            records,
            state,
        };
        self.listener.telegram_received(telegram);
    }

    fn reset(&mut self) {
        self.state = ParserState::WaitForStart;
        self.line.clear();
        self.record.clear();
        self.checksum.clear();
        self.header = None;
        self.records.clear();
        self.crc = State::<ARC>::new();
        self.length = 0;
    }
}

fn parens_balanced(text: &str) -> bool {
    text.matches('(').count() == text.matches(')').count()
}

fn starts_with_identifier(text: &str) -> bool {
    let identifier = text.split('(').next().unwrap_or("");
    ObisId::parse(&obis_utils::normalize_obis_code(identifier)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosem::{CosemObjectType, CosemValue};
    use std::sync::{Arc, Mutex};

    const BODY: &str = "/ISk5\\2MT382-1000\r\n\
\r\n\
1-3:0.2.8(50)\r\n\
0-0:1.0.0(101209113020W)\r\n\
0-0:96.1.1(4B384547303034303436333935353037)\r\n\
1-0:1.8.1(123456.789*kWh)\r\n\
1-0:1.8.2(123456.789*kWh)\r\n\
0-0:96.14.0(0002)\r\n\
1-0:1.7.0(01.193*kW)\r\n\
0-0:96.13.0(303132333435363738393A3B3C3D3E3F303132333435363738393A3B3C3D3E3F\r\n\
303132333435363738393A3B3C3D3E3F)\r\n\
0-1:24.1.0(003)\r\n\
0-1:96.1.0(3232323241424344313233343536373839)\r\n\
0-1:24.2.1(101209112500W)(12785.123*m3)\r\n\
!";

    fn with_checksum(body: &str) -> String {
        format!("{}{:04X}\r\n", body, utils::calculate_checksum(body.as_bytes()))
    }

    fn collecting_parser(lenient: bool) -> (P1TelegramParser, Arc<Mutex<Vec<Telegram>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let parser = P1TelegramParser::new(lenient, Box::new(move |t: Telegram| sink.lock().unwrap().push(t)));
        (parser, received)
    }

    fn parse_all(lenient: bool, data: &[u8]) -> Vec<Telegram> {
        let (mut parser, received) = collecting_parser(lenient);
        parser.parse_data(data);
        let result = received.lock().unwrap().clone();
        result
    }

    #[test]
    fn test_valid_telegram() {
        let telegrams = parse_all(false, with_checksum(BODY).as_bytes());
        assert_eq!(telegrams.len(), 1);

        let telegram = &telegrams[0];
        assert_eq!(telegram.state, TelegramState::Ok);
        assert_eq!(telegram.header.as_ref().map(|h| h.manufacturer.as_str()), Some("ISk"));
        assert_eq!(telegram.records.len(), 11);

        let message = telegram.records.iter()
            .find(|r| r.object_type == CosemObjectType::EmeterTextString)
            .unwrap();
        assert_eq!(message.values.len(), 1);

        let gas = telegram.records.iter()
            .find(|r| r.object_type == CosemObjectType::MbusValue)
            .unwrap();
        assert_eq!(gas.channel, Some(1));
        assert_eq!(gas.primary_value(), Some(CosemValue::Decimal { value: 12785.123, unit: Some("m3".to_string()) }));
    }

    #[test]
    fn test_checksum_mismatch() {
        let tampered = with_checksum(BODY).replace("01.193*kW", "01.194*kW");

        let strict = parse_all(false, tampered.as_bytes());
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].state, TelegramState::Invalid);
        assert!(strict[0].records.is_empty());

        let lenient = parse_all(true, tampered.as_bytes());
        assert_eq!(lenient.len(), 1);
        assert_eq!(lenient[0].state, TelegramState::Invalid);
        assert_eq!(lenient[0].records.len(), 11);
    }

    #[test]
    fn test_tampered_checksum_field() {
        let checksum = utils::calculate_checksum(BODY.as_bytes());
        for position in 0..4 {
            let mut digits: Vec<char> = format!("{:04X}", checksum).chars().collect();
            digits[position] = if digits[position] == '0' { '1' } else { '0' };
            let data = format!("{}{}\r\n", BODY, digits.iter().collect::<String>());

            let strict = parse_all(false, data.as_bytes());
            assert_eq!(strict.len(), 1);
            assert_eq!(strict[0].state, TelegramState::Invalid);
            assert!(strict[0].records.is_empty());

            let lenient = parse_all(true, data.as_bytes());
            assert_eq!(lenient[0].state, TelegramState::Invalid);
            assert_eq!(lenient[0].records.len(), 11);
        }

        let short = format!("{}{:03X}\r\n", BODY, checksum & 0x0FFF);
        assert_eq!(parse_all(false, short.as_bytes())[0].state, TelegramState::Invalid);
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let data = format!("garbage\r\n{}{}", with_checksum(BODY), with_checksum(BODY));
        let whole = parse_all(false, data.as_bytes());

        let (mut parser, received) = collecting_parser(false);
        for byte in data.as_bytes() {
            parser.parse_data(std::slice::from_ref(byte));
        }
        let bytewise = received.lock().unwrap().clone();

        let (mut parser, received) = collecting_parser(false);
        for chunk in data.as_bytes().chunks(7) {
            parser.parse_data(chunk);
        }
        let chunked = received.lock().unwrap().clone();

        assert_eq!(whole.len(), 2);
        assert_eq!(whole, bytewise);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_unknown_line_is_skipped() {
        let body = BODY.replace("1-0:1.7.0(01.193*kW)\r\n", "1-0:1.7.0(01.193*kW)\r\n0-0:99.99.99(42)\r\n");
        let telegrams = parse_all(false, with_checksum(&body).as_bytes());
        assert_eq!(telegrams[0].state, TelegramState::Ok);
        assert_eq!(telegrams[0].records.len(), 11);
    }

    #[test]
    fn test_malformed_record() {
        let body = BODY.replace("1-0:1.8.2(123456.789*kWh)", "1-0:1.8.2(12x456.789*kWh)");

        let strict = parse_all(false, with_checksum(&body).as_bytes());
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].state, TelegramState::Incomplete);
        assert!(strict[0].records.is_empty());

        let lenient = parse_all(true, with_checksum(&body).as_bytes());
        assert_eq!(lenient.len(), 1);
        assert_eq!(lenient[0].state, TelegramState::Ok);
        assert_eq!(lenient[0].records.len(), 10);
    }

    #[test]
    fn test_unterminated_record_keeps_following_records() {
        let body = BODY.replace("1-0:1.8.2(123456.789*kWh)", "1-0:1.8.2(123456.789*kWh");

        let lenient = parse_all(true, with_checksum(&body).as_bytes());
        assert_eq!(lenient.len(), 1);
        assert_eq!(lenient[0].state, TelegramState::Ok);
        assert_eq!(lenient[0].records.len(), 10);
        assert!(lenient[0].records.iter().all(|r| r.object_type != CosemObjectType::EmeterDeliveryTariff2));
        assert!(lenient[0].records.iter().any(|r| r.object_type == CosemObjectType::EmeterActualDelivery));
        assert!(lenient[0].records.iter().any(|r| r.object_type == CosemObjectType::MbusValue));

        let strict = parse_all(false, with_checksum(&body).as_bytes());
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].state, TelegramState::Incomplete);
    }

    #[test]
    fn test_legacy_telegram_without_checksum() {
        let telegram = "/KFM5KAIFA-METER\r\n\r\n1-0:1.8.1(000123.456*kWh)\r\n0-1:24.3.0(090212160000)(00)(60)(1)(0-1:24.2.1)(m3)\r\n(00001.001)\r\n!\r\n";
        let telegrams = parse_all(false, telegram.as_bytes());
        assert_eq!(telegrams.len(), 1);
        assert_eq!(telegrams[0].state, TelegramState::Ok);
        assert_eq!(telegrams[0].records.len(), 2);
        assert_eq!(telegrams[0].records[1].object_type, CosemObjectType::MbusValueLegacy);
    }

    #[test]
    fn test_restart_drops_unfinished_telegram() {
        let data = format!("/ISk5\\2MT382-1000\r\n\r\n1-0:1.8.1(000123.456*kWh)\r\n{}", with_checksum(BODY));
        let telegrams = parse_all(false, data.as_bytes());
        assert_eq!(telegrams.len(), 1);
        assert_eq!(telegrams[0].state, TelegramState::Ok);
        assert_eq!(telegrams[0].records.len(), 11);
    }

    #[test]
    fn test_abort_telegram() {
        let data = with_checksum(BODY);
        let (head, tail) = data.as_bytes().split_at(40);

        let (mut parser, received) = collecting_parser(false);
        parser.parse_data(head);
        parser.abort_telegram();
        parser.parse_data(tail);
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_telegram() {
        let mut data = String::from("/ISk5\\2MT382-1000\r\n\r\n");
        while data.len() <= MAX_TELEGRAM_LENGTH {
            data.push_str("0-0:99.99.99(42)\r\n");
        }
        data.push_str("!\r\n");

        let telegrams = parse_all(true, data.as_bytes());
        assert_eq!(telegrams.len(), 1);
        assert_eq!(telegrams[0].state, TelegramState::Incomplete);
    }
}
