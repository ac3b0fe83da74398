/// Exponential backoff for re-establishing a dropped link
use log::{info, warn};
use tokio::time::{sleep, Duration};

use crate::bluetooth::handle::DeviceHandle;
use crate::error::DeviceError;
use crate::models::ConnectionState;

const INITIAL_DELAY_SECS: u64 = 1;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_DELAY_SECS: u64 = 30;
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_DELAY_SECS),
            multiplier: BACKOFF_MULTIPLIER,
            max_delay: Duration::from_secs(MAX_DELAY_SECS),
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt `attempt` (0-based), None once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Some(Duration::from_secs_f64(
            scaled.min(self.max_delay.as_secs_f64()),
        ))
    }
}

/// Connect through `handle`, backing off between failed attempts
///
/// Returns the last recorded connection error once the policy gives up.
pub async fn connect_with_retry(
    handle: &DeviceHandle,
    policy: &ReconnectPolicy,
) -> Result<(), DeviceError> {
    let mut attempt = 0;
    loop {
        if handle.connect().await? == ConnectionState::Connected {
            return Ok(());
        }

        let error = handle
            .snapshot()
            .last_error
            .unwrap_or_else(|| DeviceError::Unknown("connection failed".to_string()));

        match policy.delay_for(attempt) {
            Some(delay) => {
                warn!(
                    "Connect attempt {} failed ({}), retrying in {:.1}s",
                    attempt + 1,
                    error,
                    delay.as_secs_f64()
                );
                sleep(delay).await;
                attempt += 1;
            }
            None => {
                info!("Giving up after {} attempts", attempt + 1);
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::device::BleDevice;
    use crate::bluetooth::transport::mock::MockTransport;
    use crate::models::{DeviceConfiguration, DeviceType};
    use tokio::sync::mpsc;

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    fn spawn(transport: MockTransport) -> DeviceHandle {
        let (_events_tx, events_rx) = mpsc::channel(4);
        let device = BleDevice::new(
            DeviceType::AnrMuscleSense,
            "retry".to_string(),
            transport,
            DeviceConfiguration::preset(DeviceType::AnrMuscleSense),
            Duration::from_secs(1),
        );
        DeviceHandle::spawn(device, events_rx).0
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay_for(5), None);

        let capped = ReconnectPolicy {
            max_attempts: 10,
            ..ReconnectPolicy::default()
        };
        assert_eq!(capped.delay_for(6), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn retries_until_connected() {
        let mut transport = MockTransport::for_device(DeviceType::AnrMuscleSense);
        transport.failing_connects = 2;
        let log = transport.log.clone();
        let handle = spawn(transport);

        connect_with_retry(&handle, &quick_policy(3)).await.unwrap();
        assert_eq!(log.lock().unwrap().connects, 3);
        assert_eq!(
            handle.snapshot().info.connection_state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let mut transport = MockTransport::for_device(DeviceType::AnrMuscleSense);
        transport.failing_connects = 10;
        let log = transport.log.clone();
        let handle = spawn(transport);

        let result = connect_with_retry(&handle, &quick_policy(2)).await;
        assert_eq!(
            result,
            Err(DeviceError::Unknown("connection refused".to_string()))
        );
        assert_eq!(log.lock().unwrap().connects, 3);
    }
}
