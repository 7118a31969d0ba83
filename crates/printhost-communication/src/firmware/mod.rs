//! Firmware implementations
//!
//! Supported firmware families:
//! - RepRap: Marlin, Sprinter, Repetier and compatible line-numbered firmware

pub mod reprap;

pub use reprap::{
    DeviceResponse, DriverConfig, FatalCondition, LineProtocol, ProtocolDriver, RemoteStorage,
    RepRapProtocol, SdCardStorage,
};
