use std::io;

use log::debug;
use thiserror::Error;
use tokio_serial::{DataBits, ErrorKind, SerialPort, StopBits};

use super::port_settings::{Parity, PortSettings, PortSettingsError};
use super::structs::{PortEvent, SERIAL_PORT_READ_TIMEOUT};

/// Reasons a port could not be opened
#[derive(Error, Debug)]
pub enum PortError {
    #[error("Port {0} does not exist")]
    DontExists(String),
    #[error("Port {0} is already in use")]
    InUse(String),
    #[error("Port does not support the requested settings: {0}")]
    NotCompatible(String),
    #[error("Failed to get a stream for the port: {0}")]
    Stream(String),
    #[error("Invalid port settings: {0}")]
    Configuration(#[from] PortSettingsError),
}

impl PortError {
    pub fn port_event(&self) -> PortEvent {
        match self {
            PortError::DontExists(_) => PortEvent::DontExists,
            PortError::InUse(_) => PortEvent::InUse,
            PortError::NotCompatible(_) => PortEvent::NotCompatible,
            PortError::Stream(_) => PortEvent::Error,
            PortError::Configuration(_) => PortEvent::ConfigurationError,
        }
    }
}

/// Snapshot of the line error conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStatus {
    pub break_interrupt: bool,
    pub framing_error: bool,
    pub overrun_error: bool,
    pub parity_error: bool,
}

/// An opened serial line, all calls return immediately
pub trait SerialLine: Send {
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// Current line error conditions, lines without error reporting never show any
    fn line_status(&mut self) -> io::Result<LineStatus> {
        Ok(LineStatus::default())
    }
}

pub trait SerialConnector: Send + Sync {
    fn open(&self, port_name: &str, settings: &PortSettings) -> Result<Box<dyn SerialLine>, PortError>;
}

/// Opens operating system serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerialConnector;

impl SerialConnector for NativeSerialConnector {
    fn open(&self, port_name: &str, settings: &PortSettings) -> Result<Box<dyn SerialLine>, PortError> {
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(PortError::NotCompatible(format!("{} data bits", other))),
        };
        let stop_bits = match settings.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(PortError::NotCompatible(format!("{} stop bits", other))),
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Mark | Parity::Space => {
                return Err(PortError::NotCompatible(format!("{:?} parity", settings.parity)))
            }
        };

        debug!("Opening port {} with {}", port_name, settings);
        let port = tokio_serial::new(port_name, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(SERIAL_PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| map_open_error(port_name, e))?;

        /* Make sure the port actually delivers a stream before handing it out */
        port.bytes_to_read().map_err(|e| PortError::Stream(e.to_string()))?;

        Ok(Box::new(NativeSerialLine { port }))
    }
}

fn map_open_error(port_name: &str, e: tokio_serial::Error) -> PortError {
    match e.kind() {
        ErrorKind::NoDevice | ErrorKind::Io(io::ErrorKind::NotFound) => PortError::DontExists(port_name.to_string()),
        ErrorKind::Io(io::ErrorKind::PermissionDenied) | ErrorKind::Io(io::ErrorKind::ResourceBusy) => {
            PortError::InUse(port_name.to_string())
        }
        ErrorKind::InvalidInput => PortError::NotCompatible(e.to_string()),
        _ => PortError::Stream(e.to_string()),
    }
}

struct NativeSerialLine {
    port: Box<dyn SerialPort>,
}

impl SerialLine for NativeSerialLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.port, buffer)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(dtr)?;
        self.port.write_request_to_send(rts)?;
        Ok(())
    }
}
