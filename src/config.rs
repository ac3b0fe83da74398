use std::collections::HashMap;
use std::env;

use log::info;
use tokio::time::Duration;

use crate::error::Error;
use crate::history::TimeRange;
use crate::models::DeviceType;

const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 300;
const DEFAULT_SCAN_DURATION_SECS: u64 = 10;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub device_type: DeviceType,
    /// Peripheral address; scanned for by name when absent
    pub device_address: Option<String>,
    pub collection_interval: Duration,
    pub scan_duration: Duration,
    pub connection_timeout: Duration,
    pub history_range: TimeRange,
}

impl ServiceConfig {
    pub fn new() -> Result<Self, Error> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| {
            vars.get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let device_type = match get("ORALABLE_DEVICE_TYPE") {
            Some(value) => value.parse().map_err(Error::Config)?,
            None => DeviceType::Oralable,
        };

        let device_address = get("ORALABLE_DEVICE_ADDRESS").map(str::to_uppercase);

        let history_range = match get("ORALABLE_HISTORY_RANGE") {
            Some(value) => value.parse().map_err(Error::Config)?,
            None => TimeRange::Hour,
        };

        let seconds = |key: &str, default: u64| -> Result<Duration, Error> {
            let value = match get(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| Error::Config(format!("{} must be a whole number, got '{}'", key, raw)))?,
                None => default,
            };
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", key)));
            }
            Ok(Duration::from_secs(value))
        };

        let config = ServiceConfig {
            device_type,
            device_address,
            collection_interval: seconds(
                "ORALABLE_COLLECTION_INTERVAL_SECS",
                DEFAULT_COLLECTION_INTERVAL_SECS,
            )?,
            scan_duration: seconds("ORALABLE_SCAN_DURATION_SECS", DEFAULT_SCAN_DURATION_SECS)?,
            connection_timeout: seconds(
                "ORALABLE_CONNECTION_TIMEOUT_SECS",
                DEFAULT_CONNECTION_TIMEOUT_SECS,
            )?,
            history_range,
        };

        info!(
            "Configured for {} at {}",
            config.device_type,
            config.device_address.as_deref().unwrap_or("<scan>")
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ServiceConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.device_type, DeviceType::Oralable);
        assert_eq!(config.device_address, None);
        assert_eq!(config.collection_interval, Duration::from_secs(300));
        assert_eq!(config.scan_duration, Duration::from_secs(10));
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert_eq!(config.history_range, TimeRange::Hour);
    }

    #[test]
    fn reads_every_variable() {
        let config = ServiceConfig::from_vars(vars(&[
            ("ORALABLE_DEVICE_TYPE", "anr"),
            ("ORALABLE_DEVICE_ADDRESS", " c4:7f:51:0a:12:9e "),
            ("ORALABLE_COLLECTION_INTERVAL_SECS", "60"),
            ("ORALABLE_SCAN_DURATION_SECS", "5"),
            ("ORALABLE_CONNECTION_TIMEOUT_SECS", "20"),
            ("ORALABLE_HISTORY_RANGE", "day"),
        ]))
        .unwrap();

        assert_eq!(config.device_type, DeviceType::AnrMuscleSense);
        assert_eq!(config.device_address.as_deref(), Some("C4:7F:51:0A:12:9E"));
        assert_eq!(config.collection_interval, Duration::from_secs(60));
        assert_eq!(config.scan_duration, Duration::from_secs(5));
        assert_eq!(config.connection_timeout, Duration::from_secs(20));
        assert_eq!(config.history_range, TimeRange::Day);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ServiceConfig::from_vars(vars(&[("ORALABLE_DEVICE_TYPE", "watch")])).is_err());
        assert!(ServiceConfig::from_vars(vars(&[(
            "ORALABLE_COLLECTION_INTERVAL_SECS",
            "soon"
        )]))
        .is_err());
        assert!(ServiceConfig::from_vars(vars(&[("ORALABLE_SCAN_DURATION_SECS", "0")])).is_err());
    }
}
