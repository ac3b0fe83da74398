/// Per-device task owning a [`BleDevice`]; every operation and notification
/// for one device is handled in order on that task
use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bluetooth::device::{BleDevice, DeviceSnapshot};
use crate::bluetooth::transport::{Transport, TransportEvent};
use crate::error::DeviceError;
use crate::models::{ConnectionState, DeviceConfiguration, DeviceInfo, SensorReading, SensorType};

const COMMAND_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<ConnectionState>),
    Disconnect(Reply<()>),
    StartDataStream(Reply<Result<(), DeviceError>>),
    StopDataStream(Reply<Result<(), DeviceError>>),
    SendCommand(Vec<u8>, Reply<Result<(), DeviceError>>),
    UpdateConfiguration(DeviceConfiguration, Reply<Result<(), DeviceError>>),
    UpdateDeviceInfo(Reply<Result<DeviceInfo, DeviceError>>),
    RequestReading(SensorType, Reply<Result<Vec<SensorReading>, DeviceError>>),
    Shutdown(Reply<()>),
}

#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<Command>,
    readings: broadcast::Sender<SensorReading>,
    snapshots: watch::Receiver<DeviceSnapshot>,
}

impl DeviceHandle {
    /// Move `device` onto its own task, fed by the transport's event channel
    pub fn spawn<T>(
        device: BleDevice<T>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> (Self, JoinHandle<()>)
    where
        T: Transport + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = Self {
            commands: commands_tx,
            readings: device.readings_sender(),
            snapshots: device.info_updates(),
        };
        let task = tokio::spawn(run(device, commands_rx, events));
        (handle, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorReading> {
        self.readings.subscribe()
    }

    pub fn info_updates(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshots.borrow().clone()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(Reply<R>) -> Command,
    ) -> Result<R, DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }

    pub async fn connect(&self) -> Result<ConnectionState, DeviceError> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        self.request(Command::Disconnect).await
    }

    pub async fn start_data_stream(&self) -> Result<(), DeviceError> {
        self.request(Command::StartDataStream).await?
    }

    pub async fn stop_data_stream(&self) -> Result<(), DeviceError> {
        self.request(Command::StopDataStream).await?
    }

    pub async fn send_command(&self, command: Vec<u8>) -> Result<(), DeviceError> {
        self.request(|reply| Command::SendCommand(command, reply))
            .await?
    }

    pub async fn update_configuration(
        &self,
        configuration: DeviceConfiguration,
    ) -> Result<(), DeviceError> {
        self.request(|reply| Command::UpdateConfiguration(configuration, reply))
            .await?
    }

    pub async fn update_device_info(&self) -> Result<DeviceInfo, DeviceError> {
        self.request(Command::UpdateDeviceInfo).await?
    }

    pub async fn request_reading(
        &self,
        sensor_type: SensorType,
    ) -> Result<Vec<SensorReading>, DeviceError> {
        self.request(|reply| Command::RequestReading(sensor_type, reply))
            .await?
    }

    /// Disconnect and stop the device task
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        self.request(Command::Shutdown).await
    }
}

fn stopped() -> DeviceError {
    DeviceError::Unknown("device task has stopped".to_string())
}

async fn run<T: Transport>(
    mut device: BleDevice<T>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if !execute(&mut device, command).await {
                        break;
                    }
                }
                None => {
                    device.disconnect().await;
                    break;
                }
            },
            Some(event) = events.recv() => match event {
                TransportEvent::Notification { characteristic, value, received_at } => {
                    let readings = device.on_notification(characteristic, &value, received_at);
                    debug!("{} readings from {}", readings.len(), characteristic);
                }
                TransportEvent::Disconnected => {
                    if device.state() != ConnectionState::Disconnected {
                        info!("Link to {} lost", device.info().peripheral_identifier);
                        device.disconnect().await;
                    }
                }
            },
        }
    }
    debug!("Device task for {} finished", device.info().peripheral_identifier);
}

/// Run one command; false once the task should stop
async fn execute<T: Transport>(device: &mut BleDevice<T>, command: Command) -> bool {
    // A dropped reply means the caller stopped waiting, which is fine
    match command {
        Command::Connect(reply) => {
            let _ = reply.send(device.connect().await);
        }
        Command::Disconnect(reply) => {
            device.disconnect().await;
            let _ = reply.send(());
        }
        Command::StartDataStream(reply) => {
            let _ = reply.send(device.start_data_stream().await);
        }
        Command::StopDataStream(reply) => {
            let _ = reply.send(device.stop_data_stream().await);
        }
        Command::SendCommand(bytes, reply) => {
            let _ = reply.send(device.send_command(&bytes).await);
        }
        Command::UpdateConfiguration(configuration, reply) => {
            let _ = reply.send(device.update_configuration(configuration).await);
        }
        Command::UpdateDeviceInfo(reply) => {
            let _ = reply.send(device.update_device_info().await);
        }
        Command::RequestReading(sensor_type, reply) => {
            let _ = reply.send(device.request_reading(sensor_type).await);
        }
        Command::Shutdown(reply) => {
            device.disconnect().await;
            let _ = reply.send(());
            return false;
        }
    }
    true
}
