use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use oralable_ble::bluetooth::scanner::{open_adapter, parse_address, scan_for_devices};
use oralable_ble::bluetooth::{
    connect_with_retry, BleDevice, BluerTransport, DeviceHandle, ReconnectPolicy,
};
use oralable_ble::config::ServiceConfig;
use oralable_ble::error::Error;
use oralable_ble::history::{summarize, History};
use oralable_ble::models::{ConnectionState, DeviceConfiguration, SensorReading};
use oralable_ble::utils::format_datetime;

/// Resolve the configured peripheral, scanning by name when no address is set
async fn resolve_peripheral(
    adapter: &bluer::Adapter,
    config: &ServiceConfig,
) -> Result<bluer::Device, Error> {
    let address = match &config.device_address {
        Some(address) => parse_address(address)?,
        None => {
            info!(
                "Scanning {}s for {} devices",
                config.scan_duration.as_secs(),
                config.device_type
            );
            let found = scan_for_devices(adapter, config.device_type, config.scan_duration).await?;
            match found.first() {
                Some(peripheral) => {
                    info!(
                        "Using {} at {} (rssi {:?})",
                        peripheral.name, peripheral.address, peripheral.rssi
                    );
                    peripheral.address
                }
                None => {
                    return Err(Error::Config(format!(
                        "No {} device found; set ORALABLE_DEVICE_ADDRESS",
                        config.device_type
                    )))
                }
            }
        }
    };

    Ok(adapter.device(address)?)
}

/// Connect, refresh device info and subscribe to the enabled sensors
async fn bring_up(handle: &DeviceHandle, policy: &ReconnectPolicy) -> Result<(), Error> {
    connect_with_retry(handle, policy).await?;

    match handle.update_device_info().await {
        Ok(info) => info!(
            "{} firmware {} hardware {} battery {}",
            info.name,
            info.firmware_version.as_deref().unwrap_or("?"),
            info.hardware_version.as_deref().unwrap_or("?"),
            info.battery_level
                .map(|level| format!("{}%", level))
                .unwrap_or_else(|| "?".to_string())
        ),
        Err(e) => warn!("Failed to read device info: {}", e),
    }

    handle.start_data_stream().await?;
    Ok(())
}

fn log_interval(readings: &[SensorReading], history: &History) {
    let summaries = summarize(readings);
    if summaries.is_empty() {
        warn!("No readings collected during this interval!");
        return;
    }

    for (sensor_type, summary) in &summaries {
        info!(
            "  {}: avg {:.2} {} (min {:.2}, max {:.2}, change {:+.2}) from {} samples",
            sensor_type,
            summary.average,
            sensor_type.unit(),
            summary.minimum,
            summary.maximum,
            summary.change,
            summary.samples
        );
    }

    let points = history.points();
    info!(
        "History over the last {:?}: {} buckets",
        history.range(),
        points.len()
    );
    for point in &points {
        debug!(
            "  {} {} avg {:.2} ({} samples)",
            format_datetime(&point.timestamp),
            point.sensor_type,
            point.average,
            point.samples
        );
    }
}

async fn main_loop(
    config: ServiceConfig,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting {} data collection service", config.device_type);

    // Keep the session alive for as long as the adapter is in use
    let (_session, adapter) = open_adapter().await?;
    let peripheral = resolve_peripheral(&adapter, &config).await?;
    let name = peripheral
        .name()
        .await?
        .unwrap_or_else(|| config.device_type.to_string());

    let configuration = DeviceConfiguration::preset(config.device_type);
    let auto_reconnect = configuration.auto_reconnect;
    let (events_tx, events_rx) = mpsc::channel(configuration.buffer_size);
    let transport = BluerTransport::new(peripheral, events_tx);
    let device = BleDevice::new(
        config.device_type,
        name,
        transport,
        configuration,
        config.connection_timeout,
    );
    let (handle, _task) = DeviceHandle::spawn(device, events_rx);
    let policy = ReconnectPolicy::default();

    // Run collection until it fails or the user asks to stop
    let result = tokio::select! {
        result = collect(&handle, &policy, &config, auto_reconnect) => result,
        Ok(()) = &mut shutdown => {
            info!("Program terminated by user. Exiting gracefully.");
            Ok(())
        }
    };

    if let Err(e) = handle.shutdown().await {
        warn!("Shutdown reported: {}", e);
    }
    result
}

async fn collect(
    handle: &DeviceHandle,
    policy: &ReconnectPolicy,
    config: &ServiceConfig,
    auto_reconnect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut readings = handle.subscribe();
    let mut updates = handle.info_updates();
    let mut history = History::new(config.history_range);

    bring_up(handle, policy).await?;

    loop {
        let start_time = OffsetDateTime::now_utc();
        let deadline = Instant::now() + config.collection_interval;
        let mut interval: Vec<SensorReading> = Vec::new();

        info!(
            "Starting collection interval at: {}",
            format_datetime(&start_time)
        );

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                received = readings.recv() => match received {
                    Ok(reading) => interval.push(reading),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Reading consumer fell behind, {} readings skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err("Device reading stream closed".into());
                    }
                },
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Err("Device task stopped".into());
                    }
                    let state = updates.borrow_and_update().info.connection_state;
                    if state == ConnectionState::Disconnected {
                        if !auto_reconnect {
                            return Err("Device disconnected".into());
                        }
                        warn!("Device disconnected, reconnecting");
                        bring_up(handle, policy).await?;
                    }
                }
            }
        }

        info!(
            "Collection interval complete at: {}",
            format_datetime(&OffsetDateTime::now_utc())
        );

        for reading in &interval {
            history.record(reading);
        }
        history.evict(OffsetDateTime::now_utc());

        log_interval(&interval, &history);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ServiceConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    match main_loop(config, rx).await {
        Ok(_) => info!("Program completed successfully"),
        Err(e) => error!("Fatal error: {}", e),
    }

    Ok(())
}
