//! Front end for groups of CAEN VX2740-family digitizers.
//!
//! Boards are configured from a settings store, read out into one ring
//! buffer each by worker threads, and their events are merged into
//! logical events for a sink.

pub mod aligner;
pub mod config;
pub mod data;
pub mod dig2;
pub mod digitizer_params;
pub mod error;
pub mod event;
pub mod felib;
pub mod group;
pub mod params;
pub mod reader;
pub mod ring_buffer;
pub mod settings;
pub mod sim;
pub mod sink;
pub mod store;
pub mod sync;
pub mod tui;
pub mod utils;
pub mod writer;

pub use aligner::{EventAligner, ReadyEvent};
pub use config::Conf;
pub use dig2::Dig2;
pub use error::{CodecError, DaqError, DaqResult, DeviceError, RingBufferError, SettingsError};
pub use event::{decode_event, ByteOrder, Event, EventHeader};
pub use felib::{Connector, FELibReturn, Transport};
pub use group::{BoardSummary, GroupController, RunState};
pub use reader::{ReaderState, RingBufferReader};
pub use ring_buffer::{Producer, RingBuffer};
pub use settings::{BoardErrors, BoardReadback, BoardSettings, GroupSettings, Param, SettingValue};
pub use sim::{SimConfig, SimConnector};
pub use sink::{Bank, EventSink, GroupEvent, MemorySink};
pub use store::{FileStore, ManualStore, SettingsStore};
pub use sync::FeSettings;
pub use tui::{RunOptions, Status, StatusExit};
pub use utils::Counter;
pub use writer::{Hdf5Sink, WriterOptions};
