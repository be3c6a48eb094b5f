use dsmr_bridge::{
    device::{BridgeDiscovery, DiscoveredPort, DISCOVERY_LISTEN_PERIOD},
    meter::{MeterDiscoveryListener, MeterValueListener}, obis_utils, Config, CosemObject, CosemValue, DeviceState, DeviceStateListener,
    DsmrDevice, DsmrMeter, MeterConsumer, MeterDescriptor, MeterDispatcher, NativeSerialConnector,
};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct LoggingStateListener {
    device: String,
}

impl DeviceStateListener for LoggingStateListener {
    fn state_updated(&self, old_state: DeviceState, new_state: DeviceState, details: &str) {
        debug!("[{}] {} -> {}: {}", self.device, old_state, new_state, details);
    }

    fn state_changed(&self, old_state: DeviceState, new_state: DeviceState, details: &str) {
        match new_state {
            DeviceState::ConfigurationProblem => warn!("[{}] Configuration problem: {}", self.device, details),
            _ => info!("[{}] {} -> {}: {}", self.device, old_state, new_state, details),
        }
    }
}

fn log_value(descriptor: &MeterDescriptor, record: &CosemObject, value: &CosemValue) {
    let obis = record.obis.to_string();
    let description = obis_utils::get_obis_description(&obis).unwrap_or("Unknown");
    info!("{} {} ({}): {}", descriptor, obis, description, value);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let default_filter = std::env::var("DSMR_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::load_default()?,
    };

    // Detected meters are accepted here, the dispatchers only hold weak references
    let (discovered_tx, mut discovered_rx) = mpsc::unbounded_channel::<(String, MeterDescriptor)>();
    let value_listener: Arc<dyn MeterValueListener> = Arc::new(log_value);
    let mut known_meters: HashSet<(String, MeterDescriptor)> = HashSet::new();
    let mut meters: Vec<Arc<dyn MeterConsumer>> = Vec::new();
    let mut devices: Vec<DsmrDevice> = Vec::new();

    for device_config in &config.devices {
        let name = device_config.name.clone();
        let tx = discovered_tx.clone();
        let discovery: Arc<dyn MeterDiscoveryListener> =
            Arc::new(move |d: &MeterDescriptor| tx.send((name.clone(), d.clone())).is_ok());
        let dispatcher = Arc::new(MeterDispatcher::new(Some(discovery)));

        let mut device = DsmrDevice::new(
            device_config,
            Arc::new(NativeSerialConnector),
            dispatcher,
            Arc::new(LoggingStateListener { device: device_config.name.clone() }),
        );

        for meter_config in config.meters_of(&device_config.name) {
            let descriptor = MeterDescriptor::new(meter_config.kind, meter_config.channel);
            known_meters.insert((device_config.name.clone(), descriptor.clone()));

            let meter: Arc<dyn MeterConsumer> = Arc::new(DsmrMeter::new(descriptor, value_listener.clone()));
            device.add_meter(&meter);
            meters.push(meter);
        }

        device.start_device();
        devices.push(device);
    }

    if devices.is_empty() {
        warn!("No devices configured, scanning serial ports for meters");
        let discovery = BridgeDiscovery::new(Arc::new(NativeSerialConnector), DISCOVERY_LISTEN_PERIOD);
        let report = |port: &DiscoveredPort| {
            info!("Configure a device with serial_port {} and serial_port_settings \"{}\" to use it", port.port_name, port.port_settings);
            true
        };
        if discovery.scan(&BridgeDiscovery::available_ports(), &report).await.is_empty() {
            warn!("No meters found on any serial port");
        }
        return Ok(());
    }

    info!("All devices started, now waiting for a signal to exit");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some((device_name, descriptor)) = discovered_rx.recv() => {
                if !known_meters.insert((device_name.clone(), descriptor.clone())) {
                    continue;
                }

                let Some(device) = devices.iter().find(|d| d.name() == device_name) else {
                    continue;
                };
                info!("Adding detected meter {} on device {}", descriptor, device_name);
                let meter: Arc<dyn MeterConsumer> = Arc::new(DsmrMeter::new(descriptor, value_listener.clone()));
                device.add_meter(&meter);
                meters.push(meter);
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    for device in devices.iter_mut() {
        device.stop_device();
    }

    /* Give the device tasks a moment to close their ports */
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
