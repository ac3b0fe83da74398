use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info, warn};
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::bluetooth::parser;
use crate::bluetooth::transport::Transport;
use crate::bluetooth::uuids;
use crate::error::DeviceError;
use crate::models::{
    ConnectionState, DeviceConfiguration, DeviceInfo, DeviceType, SensorReading, SensorType,
};

/// Observable view of a device, republished after every change
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub info: DeviceInfo,
    pub last_error: Option<DeviceError>,
    pub is_streaming: bool,
    pub latest_readings: HashMap<SensorType, SensorReading>,
}

/// A connected (or connectable) wearable
///
/// The device is the only writer of its info, characteristic table and
/// latest readings. Observers read through [`DeviceSnapshot`]s and the
/// readings stream.
pub struct BleDevice<T: Transport> {
    info: DeviceInfo,
    configuration: DeviceConfiguration,
    transport: T,
    connection_timeout: Duration,
    services: HashSet<Uuid>,
    // characteristic -> owning service
    characteristics: HashMap<Uuid, Uuid>,
    subscribed: BTreeSet<Uuid>,
    latest_readings: HashMap<SensorType, SensorReading>,
    last_error: Option<DeviceError>,
    is_streaming: bool,
    readings_tx: broadcast::Sender<SensorReading>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
}

impl<T: Transport> BleDevice<T> {
    pub fn new(
        device_type: DeviceType,
        name: String,
        transport: T,
        configuration: DeviceConfiguration,
        connection_timeout: Duration,
    ) -> Self {
        let info = DeviceInfo::new(device_type, name, transport.identifier());
        let (readings_tx, _) = broadcast::channel(configuration.buffer_size.max(1));
        let (snapshot_tx, _) = watch::channel(DeviceSnapshot {
            info: info.clone(),
            last_error: None,
            is_streaming: false,
            latest_readings: HashMap::new(),
        });

        Self {
            info,
            configuration,
            transport,
            connection_timeout,
            services: HashSet::new(),
            characteristics: HashMap::new(),
            subscribed: BTreeSet::new(),
            latest_readings: HashMap::new(),
            last_error: None,
            is_streaming: false,
            readings_tx,
            snapshot_tx,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.info.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.info.connection_state == ConnectionState::Connected
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.configuration
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    pub fn latest_reading(&self, sensor_type: SensorType) -> Option<&SensorReading> {
        self.latest_readings.get(&sensor_type)
    }

    pub fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains_key(&characteristic)
    }

    /// Stream of every decoded reading, in decode order
    pub fn subscribe(&self) -> broadcast::Receiver<SensorReading> {
        self.readings_tx.subscribe()
    }

    pub(crate) fn readings_sender(&self) -> broadcast::Sender<SensorReading> {
        self.readings_tx.clone()
    }

    pub fn info_updates(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(DeviceSnapshot {
            info: self.info.clone(),
            last_error: self.last_error.clone(),
            is_streaming: self.is_streaming,
            latest_readings: self.latest_readings.clone(),
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.info.connection_state != state {
            debug!(
                "{} {:?} -> {:?}",
                self.info.peripheral_identifier, self.info.connection_state, state
            );
            self.info.connection_state = state;
            self.publish();
        }
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    // BLE stack callbacks

    pub fn on_connecting(&mut self) {
        if self.info.connection_state == ConnectionState::Disconnected {
            self.last_error = None;
            self.set_state(ConnectionState::Connecting);
        }
    }

    pub fn on_services_discovered(&mut self, services: &[Uuid]) {
        self.services.extend(services.iter().copied());
        debug!(
            "Discovered {} services on {}",
            services.len(),
            self.info.peripheral_identifier
        );
    }

    pub fn on_characteristics_discovered(&mut self, service: Uuid, characteristics: &[Uuid]) {
        for characteristic in characteristics {
            self.characteristics.insert(*characteristic, service);
        }

        let complete = uuids::expected_characteristics(self.info.device_type)
            .iter()
            .all(|uuid| self.characteristics.contains_key(uuid));

        if complete && self.info.connection_state == ConnectionState::Connecting {
            info!(
                "Connected to {} ({})",
                self.info.name, self.info.peripheral_identifier
            );
            self.set_state(ConnectionState::Connected);
        }
    }

    pub fn on_connection_failed(&mut self, error: DeviceError) {
        warn!(
            "Connection to {} failed: {}",
            self.info.peripheral_identifier, error
        );
        self.last_error = Some(error);
        self.set_state(ConnectionState::ConnectionFailed);
        self.reset_link();
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn on_disconnected(&mut self) {
        self.reset_link();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Handle a notification pushed by the transport
    ///
    /// Values that arrive after the characteristic was unsubscribed or the
    /// link was torn down are dropped.
    pub fn on_notification(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        timestamp: OffsetDateTime,
    ) -> Vec<SensorReading> {
        if !self.is_connected() || !self.subscribed.contains(&characteristic) {
            debug!(
                "Dropping stale notification from {} on {}",
                characteristic, self.info.peripheral_identifier
            );
            return Vec::new();
        }
        self.on_value_updated(characteristic, data, timestamp)
    }

    /// Decode a characteristic value and publish every resulting reading
    pub fn on_value_updated(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        timestamp: OffsetDateTime,
    ) -> Vec<SensorReading> {
        let readings = parser::decode(
            self.info.device_type,
            characteristic,
            data,
            timestamp,
            Some(&self.info.peripheral_identifier),
        );

        for reading in &readings {
            if reading.sensor_type == SensorType::Battery {
                self.info.battery_level = Some(reading.value as u8);
            }
            if !reading.is_valid() {
                debug!(
                    "{} reading {:.2} {} outside plausible range",
                    reading.sensor_type,
                    reading.value,
                    reading.sensor_type.unit()
                );
            }
            self.latest_readings
                .insert(reading.sensor_type, reading.clone());
            // No subscribers is not an error; the latest map still holds it
            let _ = self.readings_tx.send(reading.clone());
        }

        if !readings.is_empty() {
            self.publish();
        }
        readings
    }

    fn reset_link(&mut self) {
        self.services.clear();
        self.characteristics.clear();
        self.subscribed.clear();
        self.is_streaming = false;
    }

    // Operations

    /// Connect and discover the device's GATT table
    ///
    /// Failures are recorded as the last error rather than returned; the
    /// resulting state tells the caller whether it worked.
    pub async fn connect(&mut self) -> ConnectionState {
        if self.info.connection_state != ConnectionState::Disconnected {
            debug!(
                "Ignoring connect for {} in state {:?}",
                self.info.peripheral_identifier, self.info.connection_state
            );
            return self.info.connection_state;
        }

        self.on_connecting();
        info!(
            "Connecting to {} ({})",
            self.info.name, self.info.peripheral_identifier
        );

        let outcome = match timeout(self.connection_timeout, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout),
        };

        if let Err(error) = outcome {
            if let Err(e) = self.transport.disconnect().await {
                debug!("Cleanup after failed connect: {}", e);
            }
            self.on_connection_failed(error);
        }

        self.info.connection_state
    }

    async fn establish(&mut self) -> Result<(), DeviceError> {
        let device_type = self.info.device_type;
        self.transport.connect().await?;

        let services = self.transport.discover_services().await?;
        self.on_services_discovered(&services);

        if let Some(missing) = uuids::required_services(device_type)
            .iter()
            .find(|service| !self.services.contains(*service))
        {
            return Err(DeviceError::ServiceNotFound(*missing));
        }

        for service in uuids::services(device_type) {
            if !self.services.contains(service) {
                debug!("Optional service {} not present", service);
                continue;
            }
            let characteristics = self.transport.discover_characteristics(*service).await?;
            self.on_characteristics_discovered(*service, &characteristics);
        }

        if !self.is_connected() {
            let missing = uuids::expected_characteristics(device_type)
                .iter()
                .find(|uuid| !self.characteristics.contains_key(*uuid))
                .copied()
                .unwrap_or_default();
            return Err(DeviceError::CharacteristicNotFound(missing));
        }

        Ok(())
    }

    /// Tear down every subscription and drop the link; safe to repeat
    pub async fn disconnect(&mut self) {
        if self.info.connection_state == ConnectionState::Disconnected {
            return;
        }

        self.set_state(ConnectionState::Disconnecting);
        let known: Vec<Uuid> = self.characteristics.keys().copied().collect();
        for characteristic in known {
            if let Err(e) = self.transport.unsubscribe(characteristic).await {
                debug!("Failed to unsubscribe {}: {}", characteristic, e);
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!(
                "Disconnect of {} reported: {}",
                self.info.peripheral_identifier, e
            );
        }

        info!("Disconnected from {}", self.info.peripheral_identifier);
        self.on_disconnected();
    }

    fn stream_characteristics(&self) -> BTreeSet<Uuid> {
        self.configuration
            .enabled_sensors
            .iter()
            .filter_map(|sensor| uuids::characteristic_for(self.info.device_type, *sensor))
            .collect()
    }

    async fn apply_subscriptions(&mut self) -> Result<(), DeviceError> {
        let wanted = if self.configuration.notifications_enabled {
            self.stream_characteristics()
        } else {
            BTreeSet::new()
        };

        let stale: Vec<Uuid> = self.subscribed.difference(&wanted).copied().collect();
        for characteristic in stale {
            self.transport.unsubscribe(characteristic).await?;
            self.subscribed.remove(&characteristic);
        }

        for characteristic in wanted {
            if self.subscribed.contains(&characteristic) {
                continue;
            }
            if !self.characteristics.contains_key(&characteristic) {
                warn!(
                    "{} does not expose {}, skipping",
                    self.info.peripheral_identifier, characteristic
                );
                continue;
            }
            self.transport.subscribe(characteristic).await?;
            self.subscribed.insert(characteristic);
        }
        Ok(())
    }

    pub async fn start_data_stream(&mut self) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        if !self.configuration.notifications_enabled {
            warn!("Notifications disabled; readings only arrive on request");
        }
        self.apply_subscriptions().await?;
        self.is_streaming = true;
        info!(
            "Streaming {} characteristics from {}",
            self.subscribed.len(),
            self.info.peripheral_identifier
        );
        self.publish();
        Ok(())
    }

    pub async fn stop_data_stream(&mut self) -> Result<(), DeviceError> {
        if !self.is_streaming {
            return Ok(());
        }
        let subscribed: Vec<Uuid> = self.subscribed.iter().copied().collect();
        for characteristic in subscribed {
            self.transport.unsubscribe(characteristic).await?;
            self.subscribed.remove(&characteristic);
        }
        self.is_streaming = false;
        self.publish();
        Ok(())
    }

    /// Write a raw command to the vendor command characteristic
    pub async fn send_command(&mut self, command: &[u8]) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        if !self.has_characteristic(uuids::COMMAND) {
            return Err(DeviceError::CharacteristicNotFound(uuids::COMMAND));
        }
        debug!(
            "Writing {} byte command to {}",
            command.len(),
            self.info.peripheral_identifier
        );
        self.transport
            .write(uuids::COMMAND, command)
            .await
            .map_err(|e| match e {
                DeviceError::WriteCommandFailed(_) => e,
                other => DeviceError::WriteCommandFailed(other.to_string()),
            })
    }

    pub async fn update_configuration(
        &mut self,
        configuration: DeviceConfiguration,
    ) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        configuration.validate(self.info.device_type)?;
        self.configuration = configuration;
        if self.is_streaming {
            self.apply_subscriptions().await?;
        }
        self.publish();
        Ok(())
    }

    /// Refresh battery, firmware, hardware and signal strength
    pub async fn update_device_info(&mut self) -> Result<DeviceInfo, DeviceError> {
        self.ensure_connected()?;

        // Nothing is applied until every read has succeeded
        let mut battery_level = self.info.battery_level;
        let mut firmware_version = self.info.firmware_version.clone();
        let mut hardware_version = self.info.hardware_version.clone();

        if self.has_characteristic(uuids::BATTERY_LEVEL) {
            let data = self.transport.read(uuids::BATTERY_LEVEL).await?;
            if let Some(level) = data.first() {
                battery_level = Some(*level);
            }
        }
        if self.has_characteristic(uuids::FIRMWARE_REVISION) {
            let data = self.transport.read(uuids::FIRMWARE_REVISION).await?;
            firmware_version = Some(revision_string(&data));
        }
        if self.has_characteristic(uuids::HARDWARE_REVISION) {
            let data = self.transport.read(uuids::HARDWARE_REVISION).await?;
            hardware_version = Some(revision_string(&data));
        }
        let signal_strength = self.transport.rssi().await?;

        self.info.battery_level = battery_level;
        self.info.firmware_version = firmware_version;
        self.info.hardware_version = hardware_version;
        self.info.signal_strength = signal_strength;
        self.publish();
        Ok(self.info.clone())
    }

    /// Read one sensor on demand; the result is published like a notification
    pub async fn request_reading(
        &mut self,
        sensor_type: SensorType,
    ) -> Result<Vec<SensorReading>, DeviceError> {
        self.ensure_connected()?;
        let characteristic = uuids::characteristic_for(self.info.device_type, sensor_type)
            .ok_or(DeviceError::UnsupportedSensor(sensor_type))?;
        if !self.has_characteristic(characteristic) {
            return Err(DeviceError::CharacteristicNotFound(characteristic));
        }

        let data = self.transport.read(characteristic).await?;
        let readings: Vec<SensorReading> = self
            .on_value_updated(characteristic, &data, OffsetDateTime::now_utc())
            .into_iter()
            .filter(|reading| reading.sensor_type == sensor_type)
            .collect();

        if readings.is_empty() {
            return Err(DeviceError::DataParsingFailed(format!(
                "{} byte payload held no {} reading",
                data.len(),
                sensor_type
            )));
        }
        Ok(readings)
    }
}

fn revision_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
