//! Boundary to the vendor front-end library.
//!
//! The library itself (device discovery, the parameter tree, the data
//! endpoints) lives outside this crate. Everything the front end needs from it
//! goes through [`Transport`], one connected board, and [`Connector`], which
//! opens boards by URL. The simulated digitizer in [`crate::sim`] implements
//! both.

use ndarray::Array2;
use std::fmt;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum FELibReturn {
    Success = 0,
    Generic = -1,
    InvalidParam = -2,
    DevAlreadyOpen = -3,
    DevNotFound = -4,
    MaxDev = -5,
    Command = -6,
    Internal = -7,
    NotImplemented = -8,
    InvalidHandle = -9,
    DevLibNotAvailable = -10,
    Timeout = -11,
    Stop = -12,
    Disabled = -13,
    BadLibVer = -14,
    Comm = -15,
    Unknown = 1,
}

impl From<i32> for FELibReturn {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::Generic,
            -2 => Self::InvalidParam,
            -3 => Self::DevAlreadyOpen,
            -4 => Self::DevNotFound,
            -5 => Self::MaxDev,
            -6 => Self::Command,
            -7 => Self::Internal,
            -8 => Self::NotImplemented,
            -9 => Self::InvalidHandle,
            -10 => Self::DevLibNotAvailable,
            -11 => Self::Timeout,
            -12 => Self::Stop,
            -13 => Self::Disabled,
            -14 => Self::BadLibVer,
            -15 => Self::Comm,
            _ => Self::Unknown,
        }
    }
}

impl FELibReturn {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Generic => "Generic",
            Self::InvalidParam => "InvalidParam",
            Self::DevAlreadyOpen => "DevAlreadyOpen",
            Self::DevNotFound => "DevNotFound",
            Self::MaxDev => "MaxDev",
            Self::Command => "Command",
            Self::Internal => "Internal",
            Self::NotImplemented => "NotImplemented",
            Self::InvalidHandle => "InvalidHandle",
            Self::DevLibNotAvailable => "DevLibNotAvailable",
            Self::Timeout => "Timeout",
            Self::Stop => "Stop",
            Self::Disabled => "Disabled",
            Self::BadLibVer => "BadLibVer",
            Self::Comm => "Comm",
            Self::Unknown => "Unknown",
        }
    }

    /// Read calls report "nothing arrived within the timeout" this way; it is
    /// not a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for FELibReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as i32)
    }
}

impl std::error::Error for FELibReturn {}

/// Data endpoints a board can stream from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Undecoded bytes in the board's network-order wire format.
    Raw,
    /// Decoded waveforms from the scope firmware.
    Scope,
    /// Decoded single-channel hits from the open DPP firmware.
    OpenDpp,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Raw => "/endpoint/raw",
            Self::Scope => "/endpoint/scope",
            Self::OpenDpp => "/endpoint/opendpp",
        }
    }

    /// Value written to `/endpoint/par/activeendpoint`.
    pub fn active_name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Scope => "scope",
            Self::OpenDpp => "opendpp",
        }
    }

    /// Field list handed to the library's read-data-format call.
    pub fn read_format(&self) -> &'static str {
        match self {
            Self::Raw => {
                r#"[{"name":"DATA","type":"U8","dim":1},{"name":"SIZE","type":"SIZE_T"}]"#
            }
            Self::Scope => {
                r#"[{"name":"TIMESTAMP","type":"U64"},{"name":"TRIGGER_ID","type":"U32"},{"name":"FLAGS","type":"U16"},{"name":"WAVEFORM","type":"U16","dim":2},{"name":"WAVEFORM_SIZE","type":"SIZE_T","dim":1}]"#
            }
            Self::OpenDpp => {
                r#"[{"name":"CHANNEL","type":"U8"},{"name":"TIMESTAMP","type":"U64"},{"name":"WAVEFORM","type":"U16","dim":1},{"name":"WAVEFORM_SIZE","type":"SIZE_T"}]"#
            }
        }
    }
}

/// Maximum number of samples in one decoded user-mode waveform.
pub const USER_WAVEFORM_MAX_SAMPLES: usize = 0x8000;

/// One event from the decoded scope endpoint. `waveforms` holds one row per
/// channel (64 rows); only rows of enabled channels are meaningful.
#[derive(Debug, Clone)]
pub struct ScopeEvent {
    pub timestamp: u64,
    pub event_counter: u32,
    pub flags: u16,
    pub waveforms: Array2<u16>,
    pub waveform_sizes: Vec<usize>,
}

impl ScopeEvent {
    pub fn new(n_channels: usize, waveform_len: usize) -> Self {
        Self {
            timestamp: 0,
            event_counter: 0,
            flags: 0,
            waveforms: Array2::zeros((n_channels, waveform_len)),
            waveform_sizes: vec![0; n_channels],
        }
    }
}

/// One hit from the decoded open DPP endpoint.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub channel: u8,
    pub timestamp: u64,
    pub waveform: Vec<u16>,
    pub waveform_size: usize,
}

impl Default for UserEvent {
    fn default() -> Self {
        Self {
            channel: 0xFF,
            timestamp: 0,
            waveform: vec![0; USER_WAVEFORM_MAX_SAMPLES],
            waveform_size: 0,
        }
    }
}

/// One open connection to a board.
///
/// `get_value` follows the library convention of an in/out buffer: a few
/// parameters (e.g. `LVDSTrgMask`) take an argument in `value` and replace it
/// with the result.
pub trait Transport: Send {
    fn get_value(&mut self, path: &str, value: &mut String) -> Result<(), FELibReturn>;
    fn set_value(&mut self, path: &str, value: &str) -> Result<(), FELibReturn>;
    /// Children of a parameter's `allowedvalues` node.
    fn get_allowed_values(&mut self, path: &str) -> Result<Vec<String>, FELibReturn>;
    fn get_user_register(&mut self, address: u32) -> Result<u32, FELibReturn>;
    fn set_user_register(&mut self, address: u32, value: u32) -> Result<(), FELibReturn>;
    fn send_command(&mut self, path: &str) -> Result<(), FELibReturn>;
    /// Select the endpoint that subsequent reads come from.
    fn set_read_data_format(&mut self, endpoint: Endpoint) -> Result<(), FELibReturn>;
    /// Read one chunk of raw data; returns the number of bytes written.
    fn read_raw(&mut self, timeout_ms: u32, buffer: &mut [u8]) -> Result<usize, FELibReturn>;
    fn read_scope(&mut self, timeout_ms: u32, event: &mut ScopeEvent) -> Result<(), FELibReturn>;
    fn read_user(&mut self, timeout_ms: u32, event: &mut UserEvent) -> Result<(), FELibReturn>;
    /// Human-readable description of the most recent failure.
    fn last_error(&mut self) -> String;
    fn close(&mut self) -> Result<(), FELibReturn>;
}

/// Opens [`Transport`]s by URL.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Transport>, FELibReturn>;
}

/// URL for a board. At most one full-control connection per board is
/// allowed; monitor connections may coexist with it.
pub fn dig2_url(hostname: &str, monitor_only: bool) -> String {
    if monitor_only {
        format!("dig2://{hostname}/?monitor")
    } else {
        format!("dig2://{hostname}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_round_trip() {
        assert_eq!(FELibReturn::from(-11), FELibReturn::Timeout);
        assert_eq!(FELibReturn::from(0), FELibReturn::Success);
        assert_eq!(FELibReturn::from(-99), FELibReturn::Unknown);
        assert!(FELibReturn::Timeout.is_timeout());
        assert!(!FELibReturn::Comm.is_timeout());
        assert_eq!(FELibReturn::Timeout.to_string(), "Timeout (-11)");
    }

    #[test]
    fn urls() {
        assert_eq!(dig2_url("vx01", false), "dig2://vx01");
        assert_eq!(dig2_url("vx01", true), "dig2://vx01/?monitor");
    }
}
