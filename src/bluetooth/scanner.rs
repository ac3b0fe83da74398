/// Bluetooth Low Energy discovery of supported wearables
use futures_util::StreamExt;
use log::{debug, error, warn};
use tokio::time::{sleep, Duration};

use crate::error::DeviceError;
use crate::models::DeviceType;

/// A wearable seen during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    pub address: bluer::Address,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Open a BlueZ session and power on the default adapter
///
/// The session must outlive every handle obtained from the adapter.
pub async fn open_adapter() -> Result<(bluer::Session, bluer::Adapter), bluer::Error> {
    let session = match bluer::Session::new().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create Bluetooth session: {}", e);
            return Err(e);
        }
    };

    let adapter = match session.default_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to get default Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = adapter.set_powered(true).await {
        error!("Failed to power on adapter: {}", e);
        return Err(e);
    }

    Ok((session, adapter))
}

/// Parse a configured `XX:XX:XX:XX:XX:XX` peripheral address
pub fn parse_address(raw: &str) -> Result<bluer::Address, DeviceError> {
    raw.trim()
        .parse::<bluer::Address>()
        .map_err(|e| DeviceError::InvalidPeripheral(format!("'{}': {}", raw, e)))
}

/// Whether an advertised name belongs to the given device type
pub fn matches_device(name: Option<&str>, device_type: DeviceType) -> bool {
    name.map(|name| name.starts_with(device_type.name_prefix()))
        .unwrap_or(false)
}

/// Strongest signal first; peripherals without RSSI last
pub fn sort_by_signal(peripherals: &mut [DiscoveredPeripheral]) {
    peripherals.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
}

/// Scan for wearables of `device_type`
///
/// Discovery runs for `duration`, then every known device whose advertised
/// name carries the device type's prefix is returned, strongest first.
pub async fn scan_for_devices(
    adapter: &bluer::Adapter,
    device_type: DeviceType,
    duration: Duration,
) -> Result<Vec<DiscoveredPeripheral>, bluer::Error> {
    // Configure discovery filter for Low Energy devices only
    let filter = bluer::DiscoveryFilter {
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: false,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    // Discovery only runs while the event stream is alive
    let discovery_handle = match adapter.discover_devices().await {
        Ok(discovery_stream) => tokio::spawn(async move {
            let mut stream = discovery_stream;
            while let Some(event) = stream.next().await {
                debug!("Discovery event: {:?}", event);
            }
        }),
        Err(e) => {
            error!("Failed to start device discovery: {}", e);
            return Err(e);
        }
    };

    sleep(duration).await;
    discovery_handle.abort();

    let addresses = match adapter.device_addresses().await {
        Ok(addresses) => addresses,
        Err(e) => {
            error!("Failed to get device addresses: {}", e);
            return Err(e);
        }
    };

    let mut found = Vec::new();
    for address in addresses {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(_) => continue,
        };

        let name = match device.name().await {
            Ok(name) => name,
            Err(e) => {
                debug!("Failed to get name for {}: {}", address, e);
                continue;
            }
        };

        if !matches_device(name.as_deref(), device_type) {
            continue;
        }

        let rssi = device.rssi().await.unwrap_or(None);
        debug!("Found {:?} at {} (rssi {:?})", name, address, rssi);
        found.push(DiscoveredPeripheral {
            address,
            name: name.unwrap_or_default(),
            rssi,
        });
    }

    sort_by_signal(&mut found);
    Ok(found)
}
