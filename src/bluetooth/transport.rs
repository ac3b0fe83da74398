/// Seam between a device object and the platform BLE stack
use std::collections::HashMap;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{DeviceEvent, DeviceProperty};
use futures_util::{pin_mut, StreamExt};
use log::{debug, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::error::DeviceError;

const SERVICES_RESOLVE_POLL_MS: u64 = 100;

/// Asynchronous events pushed by the BLE stack
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
        received_at: OffsetDateTime,
    },
    /// The link dropped without being asked to
    Disconnected,
}

#[async_trait]
pub trait Transport: Send {
    /// Stable identifier of the peripheral (its address)
    fn identifier(&self) -> String;
    async fn connect(&mut self) -> Result<(), DeviceError>;
    async fn discover_services(&mut self) -> Result<Vec<Uuid>, DeviceError>;
    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>, DeviceError>;
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError>;
    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError>;
    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError>;
    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError>;
    async fn rssi(&mut self) -> Result<Option<i16>, DeviceError>;
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
}

/// BlueZ-backed transport
pub struct BluerTransport {
    device: bluer::Device,
    events: mpsc::Sender<TransportEvent>,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<Uuid, Characteristic>,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
    link_watcher: Option<JoinHandle<()>>,
}

impl BluerTransport {
    pub fn new(device: bluer::Device, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            device,
            events,
            services: HashMap::new(),
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
            link_watcher: None,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, DeviceError> {
        self.characteristics
            .get(&uuid)
            .ok_or(DeviceError::CharacteristicNotFound(uuid))
    }

    async fn watch_link(&mut self) -> Result<(), DeviceError> {
        let stream = self.device.events().await?;
        let events = self.events.clone();
        let address = self.device.address();

        self.link_watcher = Some(tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    debug!("Link to {} dropped", address);
                    let _ = events.send(TransportEvent::Disconnected).await;
                    break;
                }
            }
        }));
        Ok(())
    }

    fn teardown(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        if let Some(watcher) = self.link_watcher.take() {
            watcher.abort();
        }
        self.characteristics.clear();
        self.services.clear();
    }
}

#[async_trait]
impl Transport for BluerTransport {
    fn identifier(&self) -> String {
        self.device.address().to_string().to_uppercase()
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.device.connect().await?;

        // BlueZ populates the GATT tree asynchronously after connecting
        while !self.device.is_services_resolved().await? {
            sleep(Duration::from_millis(SERVICES_RESOLVE_POLL_MS)).await;
        }

        self.watch_link().await
    }

    async fn discover_services(&mut self) -> Result<Vec<Uuid>, DeviceError> {
        let mut uuids = Vec::new();
        for service in self.device.services().await? {
            let uuid = service.uuid().await?;
            uuids.push(uuid);
            self.services.insert(uuid, service);
        }
        Ok(uuids)
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>, DeviceError> {
        let handle = self
            .services
            .get(&service)
            .ok_or(DeviceError::ServiceNotFound(service))?;

        let mut uuids = Vec::new();
        for characteristic in handle.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            uuids.push(uuid);
            self.characteristics.insert(uuid, characteristic);
        }
        Ok(uuids)
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError> {
        if self.subscriptions.contains_key(&characteristic) {
            return Ok(());
        }

        let stream = self
            .characteristic(characteristic)?
            .notify()
            .await
            .map_err(|e| DeviceError::ReadFailed(e.to_string()))?;
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                let event = TransportEvent::Notification {
                    characteristic,
                    value,
                    received_at: OffsetDateTime::now_utc(),
                };
                // Waits for capacity so a slow consumer slows the link down
                if events.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", characteristic);
        });

        self.subscriptions.insert(characteristic, task);
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError> {
        // Dropping the notify stream stops notifications in BlueZ
        if let Some(task) = self.subscriptions.remove(&characteristic) {
            task.abort();
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        self.characteristic(characteristic)?
            .read()
            .await
            .map_err(|e| DeviceError::ReadFailed(e.to_string()))
    }

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        self.characteristic(characteristic)?
            .write(data)
            .await
            .map_err(|e| DeviceError::WriteCommandFailed(e.to_string()))
    }

    async fn rssi(&mut self) -> Result<Option<i16>, DeviceError> {
        Ok(self.device.rssi().await?)
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.teardown();
        if let Err(e) = self.device.disconnect().await {
            warn!("Failed to disconnect {}: {}", self.identifier(), e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory transport for device and actor tests

    use std::collections::{BTreeSet, HashMap};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bluetooth::uuids;
    use crate::models::DeviceType;

    /// Everything the mock was asked to do, shared with the test
    #[derive(Debug, Default)]
    pub struct MockLog {
        pub connects: usize,
        pub disconnects: usize,
        pub subscribed: BTreeSet<Uuid>,
        pub unsubscribe_calls: usize,
        pub writes: Vec<(Uuid, Vec<u8>)>,
        pub reads: Vec<Uuid>,
    }

    pub struct MockTransport {
        pub services: HashMap<Uuid, Vec<Uuid>>,
        pub values: HashMap<Uuid, Vec<u8>>,
        pub failing_connects: usize,
        pub connect_delay: Option<Duration>,
        pub rssi: Option<i16>,
        pub log: Arc<Mutex<MockLog>>,
    }

    impl MockTransport {
        /// A transport exposing every service and characteristic the device type uses
        pub fn for_device(device_type: DeviceType) -> Self {
            let mut services = HashMap::new();
            services.insert(uuids::HEART_RATE_SERVICE, vec![uuids::HEART_RATE_MEASUREMENT]);
            services.insert(uuids::BATTERY_SERVICE, vec![uuids::BATTERY_LEVEL]);
            services.insert(
                uuids::DEVICE_INFORMATION_SERVICE,
                vec![uuids::FIRMWARE_REVISION, uuids::HARDWARE_REVISION],
            );
            services.insert(uuids::CONTROL_SERVICE, vec![uuids::COMMAND]);
            if device_type == DeviceType::Oralable {
                services.insert(
                    uuids::HEALTH_THERMOMETER_SERVICE,
                    vec![uuids::TEMPERATURE_MEASUREMENT],
                );
                services.insert(
                    uuids::PULSE_OXIMETER_SERVICE,
                    vec![uuids::PLX_CONTINUOUS_MEASUREMENT],
                );
            }

            Self {
                services,
                values: HashMap::new(),
                failing_connects: 0,
                connect_delay: None,
                rssi: Some(-60),
                log: Arc::new(Mutex::new(MockLog::default())),
            }
        }

        pub fn with_value(mut self, characteristic: Uuid, value: &[u8]) -> Self {
            self.values.insert(characteristic, value.to_vec());
            self
        }

        fn knows(&self, characteristic: Uuid) -> bool {
            self.services
                .values()
                .any(|characteristics| characteristics.contains(&characteristic))
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn identifier(&self) -> String {
            "AA:BB:CC:DD:EE:FF".to_string()
        }

        async fn connect(&mut self) -> Result<(), DeviceError> {
            if let Some(delay) = self.connect_delay {
                sleep(delay).await;
            }
            self.log.lock().unwrap().connects += 1;
            if self.failing_connects > 0 {
                self.failing_connects -= 1;
                return Err(DeviceError::Unknown("connection refused".into()));
            }
            Ok(())
        }

        async fn discover_services(&mut self) -> Result<Vec<Uuid>, DeviceError> {
            Ok(self.services.keys().copied().collect())
        }

        async fn discover_characteristics(
            &mut self,
            service: Uuid,
        ) -> Result<Vec<Uuid>, DeviceError> {
            self.services
                .get(&service)
                .cloned()
                .ok_or(DeviceError::ServiceNotFound(service))
        }

        async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError> {
            if !self.knows(characteristic) {
                return Err(DeviceError::CharacteristicNotFound(characteristic));
            }
            self.log.lock().unwrap().subscribed.insert(characteristic);
            Ok(())
        }

        async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), DeviceError> {
            let mut log = self.log.lock().unwrap();
            log.unsubscribe_calls += 1;
            log.subscribed.remove(&characteristic);
            Ok(())
        }

        async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
            self.log.lock().unwrap().reads.push(characteristic);
            self.values
                .get(&characteristic)
                .cloned()
                .ok_or_else(|| DeviceError::ReadFailed(format!("no value for {}", characteristic)))
        }

        async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
            self.log
                .lock()
                .unwrap()
                .writes
                .push((characteristic, data.to_vec()));
            Ok(())
        }

        async fn rssi(&mut self) -> Result<Option<i16>, DeviceError> {
            Ok(self.rssi)
        }

        async fn disconnect(&mut self) -> Result<(), DeviceError> {
            let mut log = self.log.lock().unwrap();
            log.disconnects += 1;
            log.subscribed.clear();
            Ok(())
        }
    }
}
