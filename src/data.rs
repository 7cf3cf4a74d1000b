use crate::error::DeviceError;
use crate::event::{self, ByteOrder, NUM_CHANNELS};
use crate::felib::{Endpoint, FELibReturn, ScopeEvent, Transport, UserEvent};
use crate::params::FirmwareType;
use log::{debug, error};

/// Which reads the data handle is currently set up for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMode {
    NotSetUp,
    Raw,
    DecodedScope,
    DecodedUser,
}

impl DataMode {
    fn name(&self) -> &'static str {
        match self {
            Self::NotSetUp => "no",
            Self::Raw => "raw",
            Self::DecodedScope => "decoded scope",
            Self::DecodedUser => "decoded user",
        }
    }
}

/// Outcome of one read attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// An event (or, for raw reads, a chunk of events) of this many bytes was
    /// written to the output buffer in host order.
    Event(usize),
    /// Nothing arrived before the timeout.
    NoEvent,
}

/// Data handle of one board.
///
/// Every successful read leaves complete events in the canonical host-order
/// wire layout, whatever endpoint they came from.
#[derive(Debug)]
pub struct DataReader {
    mode: DataMode,
    user_event_count: u32,
    convert_to_host_order: bool,
    scope_event: ScopeEvent,
    user_event: UserEvent,
}

impl Default for DataReader {
    fn default() -> Self {
        Self {
            mode: DataMode::NotSetUp,
            user_event_count: 0,
            convert_to_host_order: true,
            scope_event: ScopeEvent::new(NUM_CHANNELS, 0),
            user_event: UserEvent::default(),
        }
    }
}

impl DataReader {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// Raw reads are converted from network order unless this is switched
    /// off, which saves a pass over the data but leaves it in board order.
    /// Ring readout needs host order; a board's [`crate::dig2::Dig2`] handle
    /// never switches it off.
    pub fn set_convert_to_host_order(&mut self, convert: bool) {
        self.convert_to_host_order = convert;
    }

    /// Byte order of the events this handle leaves in the output buffer.
    pub fn byte_order(&self) -> ByteOrder {
        if self.convert_to_host_order || self.mode != DataMode::Raw {
            ByteOrder::Host
        } else {
            ByteOrder::Network
        }
    }

    /// Number the next user-mode event will get.
    pub fn user_event_count(&self) -> u32 {
        self.user_event_count
    }

    /// Choose the endpoint: raw if asked, otherwise the decoded endpoint of
    /// the running firmware. Restarts user-mode event numbering.
    pub fn setup_data_handle(
        &mut self,
        raw: bool,
        firmware: &FirmwareType,
        transport: &mut dyn Transport,
        board: &str,
    ) -> Result<DataMode, DeviceError> {
        self.user_event_count = 0;
        self.mode = DataMode::NotSetUp;

        let (endpoint, mode) = if raw {
            (Endpoint::Raw, DataMode::Raw)
        } else if *firmware == FirmwareType::Scope {
            (Endpoint::Scope, DataMode::DecodedScope)
        } else {
            (Endpoint::OpenDpp, DataMode::DecodedUser)
        };

        let path = "/endpoint/par/activeendpoint";
        if let Err(code) = transport.set_value(path, endpoint.active_name()) {
            let message = DeviceError::describe(code, &transport.last_error());
            error!("Failed to set active endpoint of {board}. The board firmware or library may be too old.");
            return Err(DeviceError::Set {
                path: path.to_string(),
                message,
            });
        }

        if let Err(code) = transport.set_read_data_format(endpoint) {
            return Err(DeviceError::Set {
                path: endpoint.path().to_string(),
                message: DeviceError::describe(code, &transport.last_error()),
            });
        }

        debug!("Data handle of {board} reads from {}", endpoint.path());
        self.mode = mode;
        Ok(mode)
    }

    /// Read whatever the configured endpoint delivers into `out`.
    pub fn read_event(
        &mut self,
        transport: &mut dyn Transport,
        board: &str,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> Result<ReadStatus, DeviceError> {
        match self.mode {
            DataMode::Raw => self.get_raw_data(transport, board, timeout_ms, out),
            DataMode::DecodedScope => self.get_decoded_scope_data(transport, board, timeout_ms, out),
            DataMode::DecodedUser => self.get_decoded_user_data(transport, board, timeout_ms, out),
            DataMode::NotSetUp => Err(DeviceError::DataHandle {
                board: board.to_string(),
                wanted: "any",
            }),
        }
    }

    pub fn get_raw_data(
        &mut self,
        transport: &mut dyn Transport,
        board: &str,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> Result<ReadStatus, DeviceError> {
        self.require(DataMode::Raw, board)?;

        match transport.read_raw(timeout_ms, out) {
            Ok(n) => {
                if self.convert_to_host_order {
                    event::network_to_host(&mut out[..n]);
                }
                Ok(ReadStatus::Event(n))
            }
            Err(code) => read_failure(code, transport, board),
        }
    }

    /// Read one decoded scope event and re-frame it with
    /// [`event::encode_scope_event`]. Channels reporting samples make up the
    /// enable mask.
    pub fn get_decoded_scope_data(
        &mut self,
        transport: &mut dyn Transport,
        board: &str,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> Result<ReadStatus, DeviceError> {
        self.require(DataMode::DecodedScope, board)?;

        if let Err(code) = transport.read_scope(timeout_ms, &mut self.scope_event) {
            return read_failure(code, transport, board);
        }

        let ev = &self.scope_event;
        let mask = ev
            .waveform_sizes
            .iter()
            .take(NUM_CHANNELS)
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .fold(0u64, |mask, (c, _)| mask | (1u64 << c));
        let wf_len = ev.waveform_sizes.iter().copied().max().unwrap_or(0);

        event::encode_scope_event(
            mask,
            wf_len,
            ev.timestamp,
            ev.event_counter,
            ev.flags,
            &ev.waveforms,
            out,
        )
        .map(ReadStatus::Event)
        .map_err(|e| DeviceError::Read {
            board: board.to_string(),
            message: e.to_string(),
        })
    }

    /// Read one decoded user-mode hit and frame it as a single-channel event
    /// numbered by this handle.
    pub fn get_decoded_user_data(
        &mut self,
        transport: &mut dyn Transport,
        board: &str,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> Result<ReadStatus, DeviceError> {
        self.require(DataMode::DecodedUser, board)?;

        if let Err(code) = transport.read_user(timeout_ms, &mut self.user_event) {
            return read_failure(code, transport, board);
        }

        let hit = &self.user_event;
        let size = hit.waveform_size.min(hit.waveform.len());
        let n = event::encode_user_event(
            hit.channel,
            self.user_event_count,
            hit.timestamp,
            &hit.waveform[..size],
            out,
        )
        .map_err(|e| DeviceError::Read {
            board: board.to_string(),
            message: e.to_string(),
        })?;
        self.user_event_count = self.user_event_count.wrapping_add(1);
        Ok(ReadStatus::Event(n))
    }

    /// Frame a user-mode hit, assigning the next local event counter.
    pub fn encode_user_event(
        &mut self,
        channel_id: u8,
        timestamp: u64,
        waveform: &[u16],
        out: &mut [u8],
    ) -> Result<usize, crate::error::CodecError> {
        let n = event::encode_user_event(channel_id, self.user_event_count, timestamp, waveform, out)?;
        self.user_event_count = self.user_event_count.wrapping_add(1);
        Ok(n)
    }

    fn require(&self, wanted: DataMode, board: &str) -> Result<(), DeviceError> {
        if self.mode == wanted {
            Ok(())
        } else {
            Err(DeviceError::DataHandle {
                board: board.to_string(),
                wanted: wanted.name(),
            })
        }
    }
}

fn read_failure(
    code: FELibReturn,
    transport: &mut dyn Transport,
    board: &str,
) -> Result<ReadStatus, DeviceError> {
    if code.is_timeout() {
        return Ok(ReadStatus::NoEvent);
    }
    Err(DeviceError::Read {
        board: board.to_string(),
        message: DeviceError::describe(code, &transport.last_error()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode_event;
    use crate::sim::{SimConfig, SimDigitizer};

    #[test]
    fn reads_require_matching_setup() {
        let mut sim = SimDigitizer::new("vx", SimConfig::default());
        let mut reader = DataReader::new();
        let mut out = vec![0u8; 1024];

        let err = reader.read_event(&mut sim, "vx", 10, &mut out).unwrap_err();
        assert!(matches!(err, DeviceError::DataHandle { .. }));

        reader
            .setup_data_handle(true, &FirmwareType::Scope, &mut sim, "vx")
            .unwrap();
        let err = reader
            .get_decoded_user_data(&mut sim, "vx", 10, &mut out)
            .unwrap_err();
        assert!(matches!(err, DeviceError::DataHandle { wanted: "decoded user", .. }));
    }

    #[test]
    fn user_counter_restarts_with_each_setup() {
        let mut sim = SimDigitizer::new("vx", SimConfig::open_dpp());
        let mut reader = DataReader::new();
        reader
            .setup_data_handle(false, &FirmwareType::DppOpen, &mut sim, "vx")
            .unwrap();
        assert_eq!(reader.mode(), DataMode::DecodedUser);

        let mut out = [0u8; 256];
        let wf = [1u16; 8];
        reader.encode_user_event(2, 10, &wf, &mut out).unwrap();
        reader.encode_user_event(2, 20, &wf, &mut out).unwrap();
        let ev = decode_event(&out, ByteOrder::Host).unwrap();
        assert_eq!(ev.header.event_counter, 1);
        assert_eq!(reader.user_event_count(), 2);

        reader
            .setup_data_handle(false, &FirmwareType::DppOpen, &mut sim, "vx")
            .unwrap();
        assert_eq!(reader.user_event_count(), 0);
    }

    fn armed_sim(channels: usize, samples: usize) -> SimDigitizer {
        let mut sim = SimDigitizer::new("vx", SimConfig::default());
        sim.set_value("/par/RecordLengthS", &samples.to_string()).unwrap();
        for ch in channels..NUM_CHANNELS {
            sim.set_value(&format!("/ch/{ch}/par/ChEnable"), "false").unwrap();
        }
        sim.send_command("/cmd/armacquisition").unwrap();
        sim.send_command("/cmd/swstartacquisition").unwrap();
        sim
    }

    #[test]
    fn decoded_scope_reads_are_reframed() {
        let mut sim = armed_sim(2, 16);
        let mut reader = DataReader::new();
        let mode = reader
            .setup_data_handle(false, &FirmwareType::Scope, &mut sim, "vx")
            .unwrap();
        assert_eq!(mode, DataMode::DecodedScope);

        sim.send_command("/cmd/sendswtrigger").unwrap();
        let mut out = vec![0u8; 4096];
        let n = match reader.read_event(&mut sim, "vx", 10, &mut out).unwrap() {
            ReadStatus::Event(n) => n,
            ReadStatus::NoEvent => panic!("software trigger produced no event"),
        };
        assert_eq!(n, (3 + 2 * 4) * 8);

        let ev = decode_event(&out[..n], ByteOrder::Host).unwrap();
        assert_eq!(ev.header.ch_enable_mask, 0b11);
        assert_eq!(ev.header.samples_per_channel(), 16);
        assert_eq!(ev.header.event_counter, 0);

        // first quad of channel 0, each sample pair swapped as a 32-bit unit
        let w = |k: usize| reader.scope_event.waveforms[[0, k]] as u32;
        let low = ((w(1) << 16) | w(0)).swap_bytes() as u64;
        let high = ((w(3) << 16) | w(2)).swap_bytes() as u64;
        assert_eq!(ev.payload_word(0), (high << 32) | low);

        assert_eq!(
            reader.read_event(&mut sim, "vx", 1, &mut out).unwrap(),
            ReadStatus::NoEvent
        );
    }

    #[test]
    fn raw_reads_can_stay_in_network_order() {
        let mut sim = armed_sim(1, 16);
        let mut reader = DataReader::new();
        reader
            .setup_data_handle(true, &FirmwareType::Scope, &mut sim, "vx")
            .unwrap();
        assert_eq!(reader.byte_order(), ByteOrder::Host);
        reader.set_convert_to_host_order(false);
        assert_eq!(reader.byte_order(), ByteOrder::Network);

        sim.send_command("/cmd/sendswtrigger").unwrap();
        let mut out = vec![0u8; 4096];
        let n = match reader.read_event(&mut sim, "vx", 10, &mut out).unwrap() {
            ReadStatus::Event(n) => n,
            ReadStatus::NoEvent => panic!("software trigger produced no event"),
        };
        let ev = decode_event(&out[..n], reader.byte_order()).unwrap();
        assert_eq!(ev.header.ch_enable_mask, 1);
        assert_eq!(ev.header.size_64bit_words, 3 + 4);
    }

    #[test]
    fn raw_timeout_is_no_event() {
        let mut sim = SimDigitizer::new("vx", SimConfig::default());
        let mut reader = DataReader::new();
        reader
            .setup_data_handle(true, &FirmwareType::Scope, &mut sim, "vx")
            .unwrap();
        let mut out = vec![0u8; 1 << 16];
        // not armed, so nothing can arrive
        assert_eq!(
            reader.read_event(&mut sim, "vx", 1, &mut out).unwrap(),
            ReadStatus::NoEvent
        );
    }
}
