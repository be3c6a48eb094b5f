use crate::cosem::CosemObject;

/// Identification line of a telegram, e.g. `/ISk5\2MT382-1000`
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramHeader {
    pub manufacturer: String,
    pub identification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramState {
    Ok,
    /// Checksum did not match the payload
    Invalid,
    /// Telegram was cut short or contained corrupted records
    Incomplete,
}

impl TelegramState {
    pub fn details(&self) -> &'static str {
        match self {
            TelegramState::Ok => "P1 telegram received successfully",
            TelegramState::Invalid => "P1 telegram checksum mismatch",
            TelegramState::Incomplete => "P1 telegram incomplete or corrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    pub header: Option<TelegramHeader>,
    pub records: Vec<CosemObject>,
    pub state: TelegramState,
}
