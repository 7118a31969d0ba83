//! RepRap firmware support
//!
//! Marlin, Sprinter, Repetier and related firmware speak a line protocol of
//! numbered, XOR-checksummed G-code lines acknowledged with `ok`. This module
//! provides framing, response parsing, the protocol driver, SD card storage
//! and the extrusion-rate updater for that family.

pub mod driver;
pub mod extrusion;
pub mod framing;
pub mod inflight;
pub mod response_parser;
pub mod storage;

pub use driver::{DriverConfig, FatalCondition, FatalHook, ProtocolDriver};
pub use extrusion::{
    distance_per_period, Direction, ExtrusionConfig, ExtrusionSink, ExtrusionUpdater, TickOutcome,
};
pub use framing::{
    checksum, command_code, format_number, strip_comments, word_value, LineProtocol, NumberedLine,
    RepRapProtocol,
};
pub use inflight::{InFlightBuffer, InFlightEntry};
pub use response_parser::{DeviceResponse, ResponseParser, StorageNotice};
pub use storage::{PlaybackStatus, RemoteStorage, SdCardStorage};
