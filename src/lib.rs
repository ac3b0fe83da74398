//! BLE device layer for Oralable wearables: characteristic decoding, the
//! per-device connection state machine and historical aggregation.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod history;
pub mod models;
pub mod utils;
