//! Error types for the front end.
//!
//! Each layer has its own enum so callers can match on the failure that
//! matters to them:
//!
//! - [`DeviceError`]: a transport call (connect, command, parameter get/set,
//!   register access, data read) failed. Carries the path or register and
//!   the message reported by the transport.
//! - [`SettingsError`]: the settings bag or the set/readback protocol failed.
//!   `ConfigMismatch` is the readback disagreeing with what was written,
//!   `Computation` is a derived setting that could not be computed.
//! - [`CodecError`]: a buffer handed to the event codec is too short or
//!   declares an impossible size.
//! - [`RingBufferError`]: a producer tried to write more than the headroom,
//!   or the buffer was reset while a producer was live.
//! - [`DaqError`]: everything the group controller and the readout workers
//!   can fail with, wrapping the above via `#[from]`.

use crate::felib::FELibReturn;
use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Error setting {path}: {message}")]
    Set { path: String, message: String },

    #[error("Error getting {path}: {message}")]
    Get { path: String, message: String },

    #[error("Failed to run command {command}: {message}")]
    Command { command: String, message: String },

    #[error("Invalid value '{value}' for {path}; not one of {allowed:?}")]
    NotAllowed {
        path: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Failed to read data from {board}: {message}")]
    Read { board: String, message: String },

    #[error("Data handle of {board} is not set up for {wanted} reads")]
    DataHandle { board: String, wanted: &'static str },

    #[error("Board {0} is not connected")]
    NotConnected(String),
}

impl DeviceError {
    /// Build the message half of an error from a transport status and its
    /// last-error text.
    pub fn describe(code: FELibReturn, last_error: &str) -> String {
        if last_error.is_empty() {
            format!("{code}")
        } else {
            format!("{code} ({last_error})")
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Unexpected readback value for '{param}' of board {board}. Set {set}, read {read}.")]
    ConfigMismatch {
        param: String,
        board: String,
        set: String,
        read: String,
    },

    #[error("Invalid FIR coefficients - {0}")]
    Computation(String),

    #[error("Unknown parameter '{0}'")]
    UnknownParam(String),

    #[error("Parameter '{param}' holds {found}, expected {expected}")]
    WrongShape {
        param: &'static str,
        expected: String,
        found: String,
    },

    #[error("Invalid value for '{param}': {message}")]
    InvalidValue { param: String, message: String },

    #[error("Settings store error: {0}")]
    Store(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer of {available} bytes is too short, need {needed}")]
    Truncated { needed: usize, available: usize },

    #[error("Event declares {words} 64-bit words, less than the 3-word header")]
    BadSize { words: u32 },

    #[error("Output buffer of {available} bytes cannot hold {needed} bytes")]
    OutputTooSmall { needed: usize, available: usize },

    #[error("Waveform for channel {channel} has {available} samples, need {needed}")]
    ShortWaveform {
        channel: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Cannot write {requested} bytes, only {available} bytes of headroom")]
    InsufficientHeadroom { requested: usize, available: usize },

    #[error("Ring buffer still has a live producer")]
    ProducerActive,
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),

    #[error("Set board {0}'s hostname/IP in the settings")]
    MissingHostname(usize),

    #[error("Board {board} is running firmware {firmware}, but is configured for {configured} mode. Edit the 'Scope mode (restart on change)' param and restart")]
    FirmwareModeMismatch {
        board: String,
        firmware: String,
        configured: &'static str,
    },

    #[error("Board {board} is running unsupported firmware type {firmware}")]
    UnsupportedFirmware { board: String, firmware: String },

    #[error("Only user FW versions >= {min} are supported. Board {board} is running version {found}")]
    FirmwareTooOld {
        board: String,
        min: u64,
        found: String,
    },

    #[error("Not possible to run in 'merge data using event ID' mode with boards using open DPP firmware")]
    MergeWithOpenFirmware,

    #[error("Error when configuring {0}")]
    Configure(String),

    #[error("Error when arming {0}")]
    Arm(String),

    #[error("Timeout waiting for all boards to be {0}")]
    BarrierTimeout(&'static str),

    #[error("Data corruption or event size too large; {board} reports an event of {size_bytes} bytes")]
    Corruption { board: String, size_bytes: u64 },

    #[error("Failed to spawn readout thread for {board}: {message}")]
    Spawn { board: String, message: String },

    #[error("Board {0} is not known to this group")]
    UnknownBoard(usize),
}
