use std::io;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use super::port_settings::PortSettings;
use super::serial::{LineStatus, SerialConnector, SerialLine};
use super::structs::PortEvent;
use crate::p1telegram::P1TelegramParser;

const READ_BUFFER_SIZE: usize = 1024;

/// Receives the events of one port session
pub trait PortEventListener: Send {
    fn handle_port_event(&mut self, event: PortEvent);
}

impl<F> PortEventListener for F
where
    F: FnMut(PortEvent) + Send,
{
    fn handle_port_event(&mut self, event: PortEvent) {
        self(event)
    }
}

/// Notifications of the serial line, error signals carry whether the condition is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSignal {
    DataAvailable,
    BreakInterrupt(bool),
    FramingError(bool),
    OverrunError(bool),
    ParityError(bool),
}

#[derive(Debug, Default)]
struct PortStatus {
    is_open: bool,
    bi: bool,
    oe: bool,
    fe: bool,
    pe: bool,
}

/// Owns one serial port and feeds everything read from it into a telegram parser
pub struct SerialPortSession {
    port_name: String,
    connector: Arc<dyn SerialConnector>,
    port_settings: PortSettings,
    fixed_port_settings: Option<PortSettings>,
    lenient_mode: bool,
    parser: P1TelegramParser,
    listener: Box<dyn PortEventListener>,
    line: Option<Box<dyn SerialLine>>,
    status: PortStatus,
    last_line_status: LineStatus,
    buffer: [u8; READ_BUFFER_SIZE],
}

impl SerialPortSession {
    pub fn new(
        port_name: &str,
        connector: Arc<dyn SerialConnector>,
        port_settings: PortSettings,
        fixed_port_settings: Option<PortSettings>,
        lenient_mode: bool,
        parser: P1TelegramParser,
        listener: Box<dyn PortEventListener>,
    ) -> Self {
        Self {
            port_name: port_name.to_string(),
            connector,
            port_settings,
            fixed_port_settings,
            lenient_mode,
            parser,
            listener,
            line: None,
            status: PortStatus::default(),
            last_line_status: LineStatus::default(),
            buffer: [0; READ_BUFFER_SIZE],
        }
    }

    pub fn port_settings(&self) -> PortSettings {
        self.port_settings
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open
    }

    pub fn open(&mut self) {
        if self.status.is_open {
            debug!("Serial port {} is already open, keep current port instance", self.port_name);
            self.listener.handle_port_event(PortEvent::Opened);
            return;
        }

        if let Err(e) = self.port_settings.validate() {
            error!("Invalid port parameters for {}: {}", self.port_name, e);
            self.listener.handle_port_event(PortEvent::ConfigurationError);
            return;
        }

        debug!("Opening port {} with {}", self.port_name, self.port_settings);
        match self.connector.open(&self.port_name, &self.port_settings) {
            Ok(mut line) => {
                /* The low speed meters want DTR off and RTS on */
                if self.port_settings == PortSettings::LOW_SPEED {
                    if let Err(e) = line.set_control_lines(false, true) {
                        warn!("Failed to set control lines on {}: {}", self.port_name, e);
                    }
                }

                self.line = Some(line);
                self.status = PortStatus {
                    is_open: true,
                    ..Default::default()
                };
                self.last_line_status = LineStatus::default();

                info!("DSMR port {} opened with {}", self.port_name, self.port_settings);
                self.listener.handle_port_event(PortEvent::Opened);
            }
            Err(e) => {
                error!("Failed to open port {}: {}", self.port_name, e);
                self.listener.handle_port_event(e.port_event());
            }
        }
    }

    pub fn close(&mut self) {
        info!("Closing DSMR port {}", self.port_name);

        self.line = None;
        self.status = PortStatus::default();
        self.last_line_status = LineStatus::default();
        self.parser.abort_telegram();

        self.listener.handle_port_event(PortEvent::Closed);
    }

    /// Toggles between the standard settings, a fixed setting is applied again instead.
    /// Takes effect on the next `open`.
    pub fn switch_port_speed(&mut self) {
        match self.fixed_port_settings {
            None => {
                self.port_settings = self.port_settings.toggled();
                debug!("Switched port settings to: {}", self.port_settings);
            }
            Some(fixed) => {
                self.port_settings = fixed;
                info!("Fixed port settings configured (autodetect disabled): {}", self.port_settings);
            }
        }
    }

    /// Checks the line for errors and pending bytes, never waits for data
    pub fn poll(&mut self) {
        let Some(line) = self.line.as_mut() else {
            return;
        };

        let line_status = line.line_status();
        let available = line.bytes_to_read();

        match line_status {
            Ok(line_status) => self.handle_line_status(line_status),
            Err(e) => debug!("Failed to get line status of {}: {}", self.port_name, e),
        }

        /* A failing query is left to read() so the error closes the port */
        if !matches!(available, Ok(0)) && self.status.is_open {
            self.handle_signal(LineSignal::DataAvailable);
        }
    }

    /// Applies a line status snapshot, conditions that appear together are handled as one
    pub fn handle_line_status(&mut self, line_status: LineStatus) {
        let previous = std::mem::replace(&mut self.last_line_status, line_status);
        if previous == line_status {
            return;
        }

        if line_status.break_interrupt != previous.break_interrupt {
            self.handle_signal(LineSignal::BreakInterrupt(line_status.break_interrupt));
        }

        let frame_rising = line_status.framing_error && !previous.framing_error;
        let parity_rising = line_status.parity_error && !previous.parity_error;
        if frame_rising && parity_rising && !self.status.fe && !self.status.pe {
            self.status.fe = true;
            self.status.pe = true;
            self.wrong_baudrate();
        } else {
            if line_status.framing_error != previous.framing_error {
                self.handle_signal(LineSignal::FramingError(line_status.framing_error));
            }
            if line_status.parity_error != previous.parity_error {
                self.handle_signal(LineSignal::ParityError(line_status.parity_error));
            }
        }

        if line_status.overrun_error != previous.overrun_error {
            self.handle_signal(LineSignal::OverrunError(line_status.overrun_error));
        }
    }

    pub fn handle_signal(&mut self, signal: LineSignal) {
        match signal {
            LineSignal::DataAvailable => {
                self.status.bi = false;
                self.status.oe = false;
                self.status.fe = false;
                self.status.pe = false;

                let event = self.read();
                trace!("Port state after read: {:?}", event);
                self.listener.handle_port_event(event);
            }
            LineSignal::BreakInterrupt(true) => {
                if !self.status.bi {
                    info!("Serial communication on {} is broken", self.port_name);
                    self.status.bi = true;
                    self.listener.handle_port_event(PortEvent::LineBroken);
                }
            }
            LineSignal::BreakInterrupt(false) => {
                self.status.bi = false;
                debug!("BI is recovered");
            }
            LineSignal::FramingError(true) => {
                if !self.status.fe {
                    self.status.fe = true;
                    if self.status.pe {
                        self.wrong_baudrate();
                    } else {
                        self.line_error("frame");
                    }
                }
            }
            LineSignal::FramingError(false) => {
                self.status.fe = false;
                debug!("FE is recovered");
            }
            LineSignal::OverrunError(true) => {
                if !self.status.oe {
                    self.status.oe = true;
                    self.line_error("overrun");
                }
            }
            LineSignal::OverrunError(false) => {
                self.status.oe = false;
                debug!("OE is recovered");
            }
            LineSignal::ParityError(true) => {
                if !self.status.pe {
                    self.status.pe = true;
                    if self.status.fe {
                        self.wrong_baudrate();
                    } else {
                        self.line_error("parity");
                    }
                }
            }
            LineSignal::ParityError(false) => {
                self.status.pe = false;
                debug!("PE is recovered");
            }
        }
    }

    fn wrong_baudrate(&mut self) {
        debug!("Experienced both parity and frame error caused possibly by a wrong baudrate");
        self.parser.abort_telegram();
        self.listener.handle_port_event(PortEvent::WrongBaudrate);
    }

    fn line_error(&mut self, kind: &str) {
        if self.lenient_mode {
            debug!("Experienced {} error", kind);
        } else {
            warn!("Experienced {} error", kind);
            self.parser.abort_telegram();
            self.listener.handle_port_event(PortEvent::ReadError);
        }
    }

    fn read(&mut self) -> PortEvent {
        if self.line.is_none() {
            info!("Read aborted: DSMR port {} is closed", self.port_name);
            return PortEvent::Closed;
        }

        match self.drain() {
            Ok(()) => PortEvent::ReadOk,
            Err(e) if self.status.is_open => {
                warn!("DSMR port {} is not available anymore, closing port", self.port_name);
                debug!("Caused by: {}", e);
                self.close();
                PortEvent::ReadError
            }
            Err(e) => {
                info!("Read aborted: DSMR port {} is closed ({})", self.port_name, e);
                PortEvent::Closed
            }
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        let Some(line) = self.line.as_mut() else {
            return Ok(());
        };

        let mut available = line.bytes_to_read()?;
        while available > 0 {
            let count = available.min(self.buffer.len());
            let read = line.read(&mut self.buffer[..count])?;
            if read == 0 {
                debug!("Expected {} bytes to read, but none were read", available);
                break;
            }
            self.parser.parse_data(&self.buffer[..read]);
            available = line.bytes_to_read()?;
        }
        Ok(())
    }
}
