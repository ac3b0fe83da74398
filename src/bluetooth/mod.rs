pub mod device;
pub mod handle;
pub mod parser;
pub mod reconnect;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use device::{BleDevice, DeviceSnapshot};
pub use handle::DeviceHandle;
pub use reconnect::{connect_with_retry, ReconnectPolicy};
pub use transport::{BluerTransport, Transport, TransportEvent};
