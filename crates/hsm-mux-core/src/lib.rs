//! Control plane of an HSM aggregator: routes PKCS#11-style RPC traffic from
//! many clients across a pool of independent devices, keeps stateful
//! operations on the device that started them, and maintains the registry
//! that lets a key be addressed by one master id wherever it lives.

pub mod balancer;
pub mod cache;
pub mod device;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod router;
pub mod session;
pub mod settings;
pub mod transport;
pub mod wire;

pub use balancer::LoadBalancer;
pub use cache::{CacheSnapshot, DeviceKeyId, KeyCache, MasterKeyId, MasterRow};
pub use device::{DeviceLoad, DeviceState};
pub use error::{MuxError, MuxResult};
pub use protocol::{HalError, KeyType, RpcFunc, key_flags};
pub use router::{Route, Router};
pub use session::{ClientHandle, Session, SessionStore};
pub use settings::MuxSettings;
pub use transport::{DeviceHandle, DeviceTransport, Inbox};
