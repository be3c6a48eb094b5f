use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{Instant, MissedTickBehavior};

use super::port::SerialPortSession;
use super::port_settings::PortSettings;
use super::serial::SerialConnector;
use super::structs::{PortEvent, PORT_POLL_INTERVAL};
use crate::p1telegram::{P1TelegramParser, Telegram, TelegramHeader, TelegramState};

/// Time each line speed is listened to, older meters only send every ten seconds
pub const DISCOVERY_LISTEN_PERIOD: Duration = Duration::from_secs(15);

/// A serial port a smart meter sends telegrams on
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPort {
    pub port_name: String,
    pub port_settings: PortSettings,
    pub header: Option<TelegramHeader>,
}

/// Decides about discovered ports, returns whether the port is accepted
pub trait BridgeDiscoveryListener: Send + Sync {
    fn bridge_discovered(&self, port: &DiscoveredPort) -> bool;
}

impl<F> BridgeDiscoveryListener for F
where
    F: Fn(&DiscoveredPort) -> bool + Send + Sync,
{
    fn bridge_discovered(&self, port: &DiscoveredPort) -> bool {
        self(port)
    }
}

/// Looks for smart meters on serial ports without a device
pub struct BridgeDiscovery {
    connector: Arc<dyn SerialConnector>,
    listen_period: Duration,
}

impl BridgeDiscovery {
    pub fn new(connector: Arc<dyn SerialConnector>, listen_period: Duration) -> Self {
        Self {
            connector,
            listen_period,
        }
    }

    pub fn available_ports() -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("Unable to list serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Checks the ports one after the other, ports that can't be opened are skipped
    pub async fn scan(&self, port_names: &[String], listener: &dyn BridgeDiscoveryListener) -> Vec<DiscoveredPort> {
        debug!("Started discovery scan on {} ports", port_names.len());

        let mut discovered = Vec::new();
        for port_name in port_names {
            debug!("Start discovery for serial port: {}", port_name);
            let Some(port) = self.check_port(port_name).await else {
                continue;
            };

            info!("Found a meter on {} with {}", port.port_name, port.port_settings);
            if !listener.bridge_discovered(&port) {
                info!("Discovery listener rejected port {}", port.port_name);
            }
            discovered.push(port);
        }
        discovered
    }

    /// Listens with both line speeds until a telegram with a valid checksum arrives
    pub async fn check_port(&self, port_name: &str) -> Option<DiscoveredPort> {
        let (telegram_tx, mut telegram_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let parser = P1TelegramParser::new(
            true,
            Box::new(move |telegram: Telegram| {
                let _ = telegram_tx.send(telegram);
            }),
        );
        let mut session = SerialPortSession::new(
            port_name,
            self.connector.clone(),
            PortSettings::HIGH_SPEED,
            None,
            true,
            parser,
            Box::new(move |event: PortEvent| {
                let _ = event_tx.send(event);
            }),
        );

        for attempt in 0..2 {
            if attempt > 0 {
                session.switch_port_speed();
            }

            /* Leftovers of the previous speed, including its CLOSED */
            while event_rx.try_recv().is_ok() {}
            while telegram_rx.try_recv().is_ok() {}

            session.open();
            if !matches!(event_rx.try_recv(), Ok(PortEvent::Opened)) {
                debug!("Unable to open {}, skipping it", port_name);
                return None;
            }

            let telegram = self.listen(&mut session, &mut telegram_rx, &mut event_rx).await;
            let port_settings = session.port_settings();
            session.close();

            if let Some(telegram) = telegram {
                return Some(DiscoveredPort {
                    port_name: port_name.to_string(),
                    port_settings,
                    header: telegram.header,
                });
            }
            debug!("No telegram on {} with {}", port_name, port_settings);
        }
        None
    }

    /* Ends on the first good telegram, the end of the period or the first line problem */
    async fn listen(
        &self,
        session: &mut SerialPortSession,
        telegram_rx: &mut UnboundedReceiver<Telegram>,
        event_rx: &mut UnboundedReceiver<PortEvent>,
    ) -> Option<Telegram> {
        let deadline = Instant::now() + self.listen_period;
        let mut poll = tokio::time::interval(PORT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while Instant::now() < deadline {
            poll.tick().await;
            session.poll();

            while let Ok(telegram) = telegram_rx.try_recv() {
                if telegram.state == TelegramState::Ok && !telegram.records.is_empty() {
                    return Some(telegram);
                }
                debug!("Ignoring telegram: {}", telegram.state.details());
            }

            while let Ok(event) = event_rx.try_recv() {
                if event != PortEvent::ReadOk {
                    debug!("Stop listening: {}", event.details());
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::device::serial::mock::MockConnector;
    use crate::device::serial::PortError;
    use crate::p1telegram::utils;

    const BODY: &str = "/ISk5\\2MT382-1000\r\n\r\n1-0:1.8.1(000123.456*kWh)\r\n!";

    fn telegram_bytes() -> Vec<u8> {
        format!("{}{:04X}\r\n", BODY, utils::calculate_checksum(BODY.as_bytes())).into_bytes()
    }

    fn discovery(connector: &MockConnector) -> BridgeDiscovery {
        BridgeDiscovery::new(Arc::new(connector.clone()), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_finds_meter() {
        let connector = MockConnector::default();
        connector.push_data(&telegram_bytes());

        let port = discovery(&connector).check_port("/dev/ttyUSB0").await.unwrap();
        assert_eq!(port.port_name, "/dev/ttyUSB0");
        assert_eq!(port.port_settings, PortSettings::HIGH_SPEED);
        assert_eq!(port.header.map(|h| h.manufacturer), Some("ISk".to_string()));
        assert_eq!(connector.opened_with(), vec![PortSettings::HIGH_SPEED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_port_tries_both_speeds() {
        let connector = MockConnector::default();

        assert_eq!(discovery(&connector).check_port("/dev/ttyUSB0").await, None);
        assert_eq!(connector.opened_with(), vec![PortSettings::HIGH_SPEED, PortSettings::LOW_SPEED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_checksum_is_not_a_meter() {
        let connector = MockConnector::default();
        let mut data = telegram_bytes();
        let last_digit = data.len() - 3;
        data[last_digit] = if data[last_digit] == b'0' { b'1' } else { b'0' };
        connector.push_data(&data);

        assert_eq!(discovery(&connector).check_port("/dev/ttyUSB0").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_skips_unusable_ports() {
        let connector = MockConnector::default();
        connector.fail_open("/dev/ttyS0", |name| PortError::InUse(name.to_string()));
        connector.push_data(&telegram_bytes());

        let accepted = Mutex::new(Vec::new());
        let listener = |port: &DiscoveredPort| {
            accepted.lock().unwrap().push(port.port_name.clone());
            true
        };

        let ports = ["/dev/ttyS0".to_string(), "/dev/ttyUSB0".to_string()];
        let found = discovery(&connector).scan(&ports, &listener).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port_name, "/dev/ttyUSB0");
        assert_eq!(*accepted.lock().unwrap(), vec!["/dev/ttyUSB0".to_string()]);
    }
}
