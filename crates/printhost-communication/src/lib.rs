//! # PrintHost Communication
//!
//! Transports and firmware protocol support for PrintHost.
//! Supports USB serial links and an in-process virtual printer.
//! Includes the RepRap line protocol driver, SD card storage and the
//! extrusion-rate updater.

pub mod communication;
pub mod firmware;

pub use communication::{
    serial::{list_ports, SerialConnector, SerialPortInfo, SerialTransport},
    virtual_printer::{VirtualConnector, VirtualPrinter},
    ConnectionParams, Connector, Transport,
};

pub use firmware::reprap::{
    Direction, DriverConfig, ExtrusionConfig, ExtrusionSink, ExtrusionUpdater, FatalCondition,
    PlaybackStatus, ProtocolDriver, RemoteStorage, SdCardStorage, StorageNotice,
};
