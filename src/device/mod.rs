use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::DeviceConfig;
use crate::cosem::CosemObject;
use crate::meter::{MeterConsumer, MeterDispatcher};
use crate::p1telegram::{P1TelegramParser, Telegram, TelegramState};

pub mod discovery;
pub mod port;
pub mod port_settings;
pub mod serial;
pub mod structs;
pub mod watchdog;

pub use discovery::{BridgeDiscovery, BridgeDiscoveryListener, DiscoveredPort, DISCOVERY_LISTEN_PERIOD};
pub use port::{LineSignal, PortEventListener, SerialPortSession};
pub use port_settings::{Parity, PortSettings, PortSettingsError};
pub use serial::{LineStatus, NativeSerialConnector, PortError, SerialConnector, SerialLine};
pub use structs::{next_state, DeviceEvent, DeviceState, PortEvent};
pub use watchdog::WatchdogService;

/// Observer of the device lifecycle, `state_updated` fires for every handled event
pub trait DeviceStateListener: Send + Sync {
    fn state_updated(&self, old_state: DeviceState, new_state: DeviceState, details: &str);

    fn state_changed(&self, old_state: DeviceState, new_state: DeviceState, details: &str);
}

#[derive(Debug)]
pub(crate) enum DeviceMessage {
    Start,
    Stop,
    Port { session_id: u64, event: PortEvent },
    Telegram { session_id: u64, telegram: Telegram },
    Alive,
}

#[derive(Debug)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub state_entered: Instant,
    pub last_telegram_received: Instant,
    pub pending_records: Vec<CosemObject>,
}

/// Handle of one P1 device, the state machine itself runs in its own task
pub struct DsmrDevice {
    name: String,
    sender: UnboundedSender<DeviceMessage>,
    dispatcher: Arc<MeterDispatcher>,
    watchdog: WatchdogService,
    watchdog_period: Duration,
    task: JoinHandle<()>,
}

impl DsmrDevice {
    /// Creates the device in SHUTDOWN, must be called inside a tokio runtime
    pub fn new(
        config: &DeviceConfig,
        connector: Arc<dyn SerialConnector>,
        dispatcher: Arc<MeterDispatcher>,
        state_listener: Arc<dyn DeviceStateListener>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let core = DeviceCore::new(config, connector, dispatcher.clone(), state_listener, sender.clone());
        let task = tokio::spawn(run(core, receiver));

        Self {
            name: config.name.clone(),
            sender,
            dispatcher,
            watchdog: WatchdogService::new(),
            watchdog_period: Duration::from_secs(config.watchdog_period),
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// (Re)starts the device, this also leaves the terminal states
    pub fn start_device(&mut self) {
        info!("Starting DSMR device {}", self.name);
        self.send(DeviceMessage::Start);

        let sender = self.sender.clone();
        self.watchdog.start(self.watchdog_period, move || {
            let _ = sender.send(DeviceMessage::Alive);
        });
    }

    pub fn stop_device(&mut self) {
        info!("Stopping DSMR device {}", self.name);
        self.send(DeviceMessage::Stop);
        self.watchdog.stop();
    }

    pub fn add_meter(&self, meter: &Arc<dyn MeterConsumer>) {
        self.dispatcher.add_meter(meter);
    }

    pub fn remove_meter(&self, meter: &Arc<dyn MeterConsumer>) {
        self.dispatcher.remove_meter(meter);
    }

    fn send(&self, message: DeviceMessage) {
        if self.sender.send(message).is_err() {
            error!("Device task of {} is gone", self.name);
        }
    }
}

impl Drop for DsmrDevice {
    fn drop(&mut self) {
        self.watchdog.stop();
        self.task.abort();
    }
}

async fn run(mut core: DeviceCore, mut receiver: UnboundedReceiver<DeviceMessage>) {
    let mut poll = tokio::time::interval(structs::PORT_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(message) => core.handle_message(message),
                None => break,
            },
            _ = poll.tick() => core.poll_port(),
        }
    }
    debug!("Device task of {} finished", core.name);
}

/// The device state machine, all state is owned by the device task
pub(crate) struct DeviceCore {
    name: String,
    serial_port: String,
    serial_port_settings: Option<String>,
    lenient_mode: bool,
    recovery_timeout: Duration,
    auto_detect_timeout: Duration,
    connector: Arc<dyn SerialConnector>,
    dispatcher: Arc<MeterDispatcher>,
    state_listener: Arc<dyn DeviceStateListener>,
    sender: UnboundedSender<DeviceMessage>,
    status: DeviceStatus,
    port_settings: PortSettings,
    session: Option<SerialPortSession>,
    session_counter: u64,
    active_session: Option<u64>,
}

impl DeviceCore {
    fn new(
        config: &DeviceConfig,
        connector: Arc<dyn SerialConnector>,
        dispatcher: Arc<MeterDispatcher>,
        state_listener: Arc<dyn DeviceStateListener>,
        sender: UnboundedSender<DeviceMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: config.name.clone(),
            serial_port: config.serial_port.clone(),
            serial_port_settings: config.serial_port_settings.clone(),
            lenient_mode: config.lenient_mode,
            recovery_timeout: Duration::from_secs(config.recovery_timeout),
            auto_detect_timeout: Duration::from_secs(config.auto_detect_timeout),
            connector,
            dispatcher,
            state_listener,
            sender,
            status: DeviceStatus {
                state: DeviceState::Shutdown,
                state_entered: now,
                last_telegram_received: now,
                pending_records: Vec::new(),
            },
            port_settings: PortSettings::HIGH_SPEED,
            session: None,
            session_counter: 0,
            active_session: None,
        }
    }

    fn handle_message(&mut self, message: DeviceMessage) {
        match message {
            DeviceMessage::Start => self.start_device(),
            DeviceMessage::Stop => {
                self.handle_event(DeviceEvent::Shutdown, DeviceEvent::Shutdown.details());
                self.release_session();
            }
            DeviceMessage::Port { session_id, event } => {
                if self.active_session == Some(session_id) {
                    self.handle_port_event(event);
                } else {
                    debug!("Ignoring {:?} of replaced port session {}", event, session_id);
                }
            }
            DeviceMessage::Telegram { session_id, telegram } => {
                if self.active_session == Some(session_id) {
                    self.telegram_received(telegram);
                } else {
                    debug!("Ignoring telegram of replaced port session {}", session_id);
                }
            }
            DeviceMessage::Alive => self.alive(),
        }
    }

    fn poll_port(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.poll();
        }
    }

    fn start_device(&mut self) {
        debug!("Starting device {} and entering INITIALIZING state", self.name);

        let old_state = self.status.state;
        let now = Instant::now();
        self.status.state = DeviceState::Initializing;
        self.status.state_entered = now;
        self.status.last_telegram_received = now;

        let details = DeviceEvent::Initialize.details();
        self.state_listener.state_updated(old_state, DeviceState::Initializing, details);
        if old_state != DeviceState::Initializing {
            self.state_listener.state_changed(old_state, DeviceState::Initializing, details);
        }
        self.evaluate_state(true);
    }

    fn handle_event(&mut self, event: DeviceEvent, details: &str) {
        let current_state = self.status.state;
        debug!("Handle device event {:?} in state {}", event, current_state);

        let new_state = match next_state(current_state, event) {
            Some(new_state) => {
                self.status.state = new_state;
                self.status.state_entered = Instant::now();
                new_state
            }
            None => {
                debug!("Ignore event {:?} in state {}", event, current_state);
                current_state
            }
        };

        self.state_listener.state_updated(current_state, new_state, details);
        if new_state != current_state {
            info!("Device {} changed from {} to {}: {}", self.name, current_state, new_state, details);
            self.state_listener.state_changed(current_state, new_state, details);
        }

        if !current_state.is_terminal() {
            self.evaluate_state(new_state != current_state);
        }
    }

    /* Runs the action of the current state, `entered` is set right after a transition */
    fn evaluate_state(&mut self, entered: bool) {
        let now = Instant::now();
        let in_state = now.duration_since(self.status.state_entered);
        let stalled = in_state > self.recovery_timeout;
        debug!("Current device state {}", self.status.state);

        match self.status.state {
            DeviceState::ConfigurationProblem => {}
            DeviceState::Initializing => {
                if entered || stalled {
                    self.initialize_session();
                }
            }
            DeviceState::Offline => {
                if stalled {
                    info!("In offline mode for at least {:?}, reinitialize device", self.recovery_timeout);
                    self.handle_event(DeviceEvent::Initialize, "In offline mode for too long, recovering");
                }
            }
            DeviceState::Online => {
                if !self.status.pending_records.is_empty() {
                    let records = std::mem::take(&mut self.status.pending_records);
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        debug!("Processing {} records", records.len());
                        dispatcher.dispatch(records);
                    });
                } else if now.duration_since(self.status.last_telegram_received) > self.recovery_timeout {
                    info!("No telegrams received for at least {:?}, reinitialize device", self.recovery_timeout);
                    self.handle_event(DeviceEvent::Error, "No telegrams received for too long");
                } else {
                    debug!("No records to handle");
                }
            }
            DeviceState::Shutdown => self.release_session(),
            DeviceState::Starting => {
                if in_state > self.auto_detect_timeout {
                    self.handle_event(DeviceEvent::SwitchBaudrate, DeviceEvent::SwitchBaudrate.details());
                }
            }
            DeviceState::SwitchPortSpeed => {
                if entered || stalled {
                    self.switch_port_speed();
                }
            }
        }

        if !self.status.pending_records.is_empty() {
            debug!(
                "Dropping {} records due to state {}",
                self.status.pending_records.len(),
                self.status.state
            );
            self.status.pending_records.clear();
        }
    }

    fn initialize_session(&mut self) {
        self.release_session();

        let parsed = self.serial_port_settings.as_deref().map(str::parse::<PortSettings>);
        let fixed_port_settings = match parsed {
            None => None,
            Some(Ok(settings)) => Some(settings),
            Some(Err(e)) => {
                error!("Invalid serial port settings for device {}: {}", self.name, e);
                self.handle_event(DeviceEvent::ConfigurationError, &e.to_string());
                return;
            }
        };
        if let Some(fixed) = fixed_port_settings {
            self.port_settings = fixed;
        }

        self.session_counter += 1;
        let session_id = self.session_counter;
        self.active_session = Some(session_id);

        let telegram_sender = self.sender.clone();
        let parser = P1TelegramParser::new(
            true,
            Box::new(move |telegram: Telegram| {
                let _ = telegram_sender.send(DeviceMessage::Telegram { session_id, telegram });
            }),
        );

        let port_sender = self.sender.clone();
        let mut session = SerialPortSession::new(
            &self.serial_port,
            self.connector.clone(),
            self.port_settings,
            fixed_port_settings,
            self.lenient_mode,
            parser,
            Box::new(move |event: PortEvent| {
                let _ = port_sender.send(DeviceMessage::Port { session_id, event });
            }),
        );
        session.open();
        self.session = Some(session);
    }

    fn switch_port_speed(&mut self) {
        match self.session.as_mut() {
            Some(session) => {
                session.switch_port_speed();
                self.port_settings = session.port_settings();
                /* The resulting CLOSED event starts the next initialization */
                session.close();
            }
            None => {
                self.port_settings = self.port_settings.toggled();
                self.handle_event(DeviceEvent::Initialize, PortEvent::Closed.details());
            }
        }
    }

    /* Drops the current session, its late events are ignored */
    fn release_session(&mut self) {
        self.active_session = None;
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn handle_port_event(&mut self, event: PortEvent) {
        debug!("Handle port event {:?}", event);
        if let Some(device_event) = event.device_event() {
            self.handle_event(device_event, event.details());
        }
    }

    fn telegram_received(&mut self, telegram: Telegram) {
        let Telegram { records, state, .. } = telegram;
        debug!("Received {} records, telegram state: {:?}", records.len(), state);

        self.status.last_telegram_received = Instant::now();

        if state == TelegramState::Ok {
            if records.is_empty() {
                info!("Parsing was successful, however there were no records");
            } else {
                self.status.pending_records.extend(records);
            }
            self.handle_event(DeviceEvent::TelegramReceived, state.details());
        } else if self.lenient_mode {
            if records.is_empty() {
                warn!("Did not receive anything at all in lenient mode");
                self.handle_event(DeviceEvent::Error, state.details());
            } else {
                debug!("Still handling records in lenient mode");
                self.status.pending_records.extend(records);
                self.handle_event(DeviceEvent::TelegramReceived, state.details());
            }
        } else {
            warn!("Dropping {} records due to incorrect parsing", records.len());
            self.handle_event(DeviceEvent::Error, state.details());
        }
    }

    fn alive(&mut self) {
        debug!("Alive");
        let now = Instant::now();
        if now.duration_since(self.status.state_entered) > self.recovery_timeout
            && now.duration_since(self.status.last_telegram_received) > self.recovery_timeout
        {
            debug!("Calling handle device state");
            self.evaluate_state(false);
        }
    }
}
