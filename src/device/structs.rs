use std::fmt;
use std::time::Duration;

/// Time allowed in STARTING before the other line speed is tried
pub const SERIAL_PORT_AUTO_DETECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Time a device may stall in a state before it is restarted
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Read timeout handed to the serial driver
pub const SERIAL_PORT_READ_TIMEOUT: Duration = Duration::from_millis(15_000);
/// Interval of the actor's serial poll
pub const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Initializing,
    Starting,
    SwitchPortSpeed,
    Online,
    Offline,
    Shutdown,
    ConfigurationProblem,
}

impl DeviceState {
    /// Terminal states only leave through an external reset
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Shutdown | DeviceState::ConfigurationProblem)
    }

    pub const ALL: [DeviceState; 7] = [
        DeviceState::Initializing,
        DeviceState::Starting,
        DeviceState::SwitchPortSpeed,
        DeviceState::Online,
        DeviceState::Offline,
        DeviceState::Shutdown,
        DeviceState::ConfigurationProblem,
    ];
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceState::Initializing => "INITIALIZING",
            DeviceState::Starting => "STARTING",
            DeviceState::SwitchPortSpeed => "SWITCH_PORT_SPEED",
            DeviceState::Online => "ONLINE",
            DeviceState::Offline => "OFFLINE",
            DeviceState::Shutdown => "SHUTDOWN",
            DeviceState::ConfigurationProblem => "CONFIGURATION_PROBLEM",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    Initialize,
    InitializeOk,
    SwitchBaudrate,
    TelegramReceived,
    ConfigurationError,
    Error,
    ReadError,
    Shutdown,
}

impl DeviceEvent {
    pub fn details(&self) -> &'static str {
        match self {
            DeviceEvent::Initialize => "Initializing DSMR device",
            DeviceEvent::InitializeOk => "Initialize DSMR device successful",
            DeviceEvent::SwitchBaudrate => "DSMR port switch baudrate",
            DeviceEvent::TelegramReceived => "DSMR device received P1 telegram successfully",
            DeviceEvent::ConfigurationError => "DSMR device has a configuration error",
            DeviceEvent::Error => "DSMR device experienced a general error",
            DeviceEvent::ReadError => "DSMR port read error",
            DeviceEvent::Shutdown => "DSMR device shutdown",
        }
    }

    pub const ALL: [DeviceEvent; 8] = [
        DeviceEvent::Initialize,
        DeviceEvent::InitializeOk,
        DeviceEvent::SwitchBaudrate,
        DeviceEvent::TelegramReceived,
        DeviceEvent::ConfigurationError,
        DeviceEvent::Error,
        DeviceEvent::ReadError,
        DeviceEvent::Shutdown,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortEvent {
    Closed,
    Opened,
    ReadOk,
    ReadError,
    LineBroken,
    ConfigurationError,
    DontExists,
    InUse,
    NotCompatible,
    WrongBaudrate,
    Error,
}

impl PortEvent {
    pub fn details(&self) -> &'static str {
        match self {
            PortEvent::Closed => "Serial port closed",
            PortEvent::Opened => "Serial port opened",
            PortEvent::ReadOk => "Read ok",
            PortEvent::ReadError => "Read error",
            PortEvent::LineBroken => "Serial line is broken (cable problem?)",
            PortEvent::ConfigurationError => "Configuration error",
            PortEvent::DontExists => "Serial port does not exist",
            PortEvent::InUse => "Serial port is already in use",
            PortEvent::NotCompatible => "Serial port is not compatible",
            PortEvent::WrongBaudrate => "Wrong baudrate",
            PortEvent::Error => "General error",
        }
    }

    /// Device event raised for this port event, `None` for events that need no reaction
    pub fn device_event(&self) -> Option<DeviceEvent> {
        match self {
            PortEvent::Closed => Some(DeviceEvent::Initialize),
            PortEvent::Opened => Some(DeviceEvent::InitializeOk),
            PortEvent::ConfigurationError | PortEvent::DontExists => Some(DeviceEvent::ConfigurationError),
            PortEvent::InUse | PortEvent::NotCompatible | PortEvent::Error => Some(DeviceEvent::Error),
            PortEvent::LineBroken | PortEvent::ReadError => Some(DeviceEvent::ReadError),
            PortEvent::WrongBaudrate => Some(DeviceEvent::SwitchBaudrate),
            PortEvent::ReadOk => None,
        }
    }
}

/// State reached when `event` arrives in `current`, `None` when the event is ignored
pub fn next_state(current: DeviceState, event: DeviceEvent) -> Option<DeviceState> {
    use DeviceState::*;

    if current.is_terminal() {
        return None;
    }

    match (event, current) {
        (DeviceEvent::Initialize, Initializing) => None,
        (DeviceEvent::Initialize, _) => Some(Initializing),
        (DeviceEvent::InitializeOk, Initializing) => Some(Starting),
        (DeviceEvent::InitializeOk, _) => None,
        (DeviceEvent::TelegramReceived, Offline | Starting) => Some(Online),
        (DeviceEvent::TelegramReceived, _) => None,
        (DeviceEvent::ReadError | DeviceEvent::SwitchBaudrate, Online) => Some(Offline),
        (DeviceEvent::ReadError | DeviceEvent::SwitchBaudrate, Starting) => Some(SwitchPortSpeed),
        (DeviceEvent::ReadError | DeviceEvent::SwitchBaudrate, _) => None,
        (DeviceEvent::Error, Offline) => None,
        (DeviceEvent::Error, _) => Some(Offline),
        (DeviceEvent::ConfigurationError, _) => Some(ConfigurationProblem),
        (DeviceEvent::Shutdown, _) => Some(Shutdown),
    }
}
