//! Per-board readout worker.
//!
//! A [`RingBufferReader`] configures its board, waits for the controller to
//! allow arming, arms, and then moves data from the board into the board's
//! ring buffer until told to stop. It runs on its own thread in
//! multithreaded mode; otherwise the controller drives the same steps
//! inline.

use crate::data::ReadStatus;
use crate::dig2::Dig2;
use crate::error::{DaqError, DaqResult};
use crate::params::FirmwareType;
use crate::ring_buffer::Producer;
use crate::settings::{BoardReadback, BoardSettings};
use crate::sync::write_and_validate;
use crate::utils::{format_bytes, lock};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Oldest open DPP firmware whose user registers are known to be safe to
/// touch.
pub const MIN_USER_MODE_FW: u64 = 2022102602;

/// Headroom kept free on top of one read.
const READ_MARGIN_BYTES: usize = 1024;
const NO_EVENT_SLEEP: Duration = Duration::from_millis(10);
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(1);
const YIELD_AFTER: Duration = Duration::from_millis(100);
const YIELD_SLEEP: Duration = Duration::from_millis(10);
const ARM_POLL: Duration = Duration::from_millis(1);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Idle = 0,
    Configuring = 1,
    Configured = 2,
    Armed = 3,
    Running = 4,
    Stopped = 5,
    Error = 6,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Configuring,
            2 => Self::Configured,
            3 => Self::Armed,
            4 => Self::Running,
            5 => Self::Stopped,
            6 => Self::Error,
            _ => Self::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// State and byte count of one reader, shared with the controller.
#[derive(Debug)]
pub struct ReaderStatus {
    state: AtomicU8,
    bytes_read: AtomicU64,
}

impl Default for ReaderStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ReaderState::Idle as u8),
            bytes_read: AtomicU64::new(0),
        }
    }
}

impl ReaderStatus {
    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.set_state(ReaderState::Idle);
        self.bytes_read.store(0, Ordering::Relaxed);
    }
}

/// Flags the controller uses to steer every reader of a run.
#[derive(Debug, Default)]
pub struct RunSignals {
    ready_to_arm: AtomicBool,
    abort_arming: AtomicBool,
    stop: AtomicBool,
}

impl RunSignals {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn allow_arming(&self) {
        self.ready_to_arm.store(true, Ordering::Release);
    }

    pub fn abort_arming(&self) {
        self.abort_arming.store(true, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn arming_allowed(&self) -> bool {
        self.ready_to_arm.load(Ordering::Acquire)
    }

    fn arming_aborted(&self) -> bool {
        self.abort_arming.load(Ordering::Acquire)
    }
}

/// Per-run options of one reader.
#[derive(Clone, Debug, Default)]
pub struct ReaderOptions {
    /// Move data off the board at all. Off means configure and arm only.
    pub enable_readout: bool,
    /// This board's data is wanted.
    pub read_data: bool,
    pub debug_settings: bool,
    pub debug_rates: bool,
    pub debug_ring_buffers: bool,
}

/// Check the firmware of a board against its configured mode, and store
/// the firmware details in the readback.
pub fn validate_firmware(
    dev: &mut Dig2,
    set: &BoardSettings,
    rdb: &mut BoardReadback,
) -> DaqResult<FirmwareType> {
    let fw_version = dev.get_firmware_version()?;
    let model = dev.get_model_name()?;
    rdb.set_firmware_info(&fw_version, &model)?;

    let firmware = dev.get_firmware_type()?;
    let scope_mode = set.is_scope_mode()?;
    let board = dev.name().to_string();

    match &firmware {
        FirmwareType::Scope => {
            if !scope_mode {
                return Err(DaqError::FirmwareModeMismatch {
                    board,
                    firmware: firmware.to_string(),
                    configured: "non-scope",
                });
            }
            rdb.set_user_firmware_info(0, 0, false)?;
        }
        FirmwareType::DppOpen => {
            let fw_rev = dev.get_user_register(0x0)?;
            let reg_rev = dev.get_user_register(0x4)?;

            let found = fw_version.trim().parse::<u64>().unwrap_or(0);
            if found < MIN_USER_MODE_FW {
                return Err(DaqError::FirmwareTooOld {
                    board,
                    min: MIN_USER_MODE_FW,
                    found: fw_version,
                });
            }
            rdb.set_user_firmware_info(fw_rev, reg_rev, true)?;

            if scope_mode {
                return Err(DaqError::FirmwareModeMismatch {
                    board,
                    firmware: firmware.to_string(),
                    configured: "scope",
                });
            }
        }
        FirmwareType::Other(_) => {
            return Err(DaqError::UnsupportedFirmware {
                board,
                firmware: firmware.to_string(),
            });
        }
    }

    Ok(firmware)
}

pub struct RingBufferReader {
    board_id: usize,
    name: String,
    device: Arc<Mutex<Dig2>>,
    settings: BoardSettings,
    readback: Arc<Mutex<BoardReadback>>,
    options: ReaderOptions,
    producer: Option<Producer>,
    status: Arc<ReaderStatus>,
    signals: Arc<RunSignals>,
    read_timeout_ms: u32,
    max_bytes_per_read: usize,
    last_sleep: Instant,
}

impl RingBufferReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        board_id: usize,
        device: Arc<Mutex<Dig2>>,
        settings: BoardSettings,
        readback: Arc<Mutex<BoardReadback>>,
        options: ReaderOptions,
        producer: Option<Producer>,
        status: Arc<ReaderStatus>,
        signals: Arc<RunSignals>,
    ) -> Self {
        let name = lock(&device).name().to_string();
        status.reset();
        Self {
            board_id,
            name,
            device,
            settings,
            readback,
            options,
            producer,
            status,
            signals,
            read_timeout_ms: 0,
            max_bytes_per_read: 0,
            last_sleep: Instant::now(),
        }
    }

    pub fn board_id(&self) -> usize {
        self.board_id
    }

    pub fn state(&self) -> ReaderState {
        self.status.state()
    }

    fn fail(&self, err: DaqError) -> DaqError {
        self.status.set_state(ReaderState::Error);
        err
    }

    /// Stop any acquisition, write and validate the settings, check the
    /// firmware and set up the data handle.
    pub fn configure(&mut self) -> DaqResult<()> {
        self.status.set_state(ReaderState::Configuring);
        match self.try_configure() {
            Ok(()) => {
                self.status.set_state(ReaderState::Configured);
                Ok(())
            }
            Err(e) => {
                error!("Failure configuring {}: {e}", self.name);
                Err(self.fail(e))
            }
        }
    }

    fn try_configure(&mut self) -> DaqResult<()> {
        let device = Arc::clone(&self.device);
        let mut dev = lock(&device);

        if let Err(e) = dev.stop_acq() {
            debug!("Stopping {} before configuring: {e}", self.name);
        }

        {
            let mut rdb = lock(&self.readback);
            validate_firmware(&mut dev, &self.settings, &mut rdb)?;
            write_and_validate(&mut dev, &self.settings, &mut rdb, self.options.debug_settings)?;
        }

        let scope_mode = self.settings.is_scope_mode()?;
        let mode = dev.setup_data_handle(scope_mode)?;
        debug!("{} reads {mode:?} data", self.name);

        self.read_timeout_ms = self.settings.read_timeout_ms()?;

        if self.options.enable_readout {
            self.max_bytes_per_read = dev.get_max_raw_bytes_per_read()? as usize;
            if let Some(producer) = &self.producer {
                if producer.capacity() <= self.max_bytes_per_read + READ_MARGIN_BYTES {
                    return Err(DaqError::Configure(format!(
                        "{}: ring buffer of {} cannot hold one read of {}",
                        self.name,
                        format_bytes(producer.capacity()),
                        format_bytes(self.max_bytes_per_read)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Arm the board, starting it too if software start is enabled.
    pub fn arm(&mut self) -> DaqResult<()> {
        info!("Arming {}", self.name);
        let result = {
            let mut dev = lock(&self.device);
            match dev.is_sw_start_enabled() {
                Ok(sw_start) => dev.start_acq(sw_start),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                info!("Armed {}", self.name);
                self.status.set_state(ReaderState::Armed);
                self.last_sleep = Instant::now();
                Ok(())
            }
            Err(e) => {
                error!("Failure starting acquisition for {}: {e}", self.name);
                Err(self.fail(DaqError::Arm(self.name.clone())))
            }
        }
    }

    /// Block until the controller allows arming. False if arming was
    /// aborted or the run stopped first.
    fn wait_for_arming(&self) -> bool {
        while !self.signals.arming_allowed() {
            if self.signals.arming_aborted() || self.signals.stop_requested() {
                return false;
            }
            thread::sleep(ARM_POLL);
        }
        true
    }

    /// One read attempt into the ring buffer.
    pub fn read_once(&mut self) -> DaqResult<ReadStatus> {
        if !self.options.enable_readout || !self.options.read_data {
            return Ok(ReadStatus::NoEvent);
        }
        let Some(producer) = self.producer.as_mut() else {
            return Ok(ReadStatus::NoEvent);
        };

        let want = self.max_bytes_per_read;
        let headroom = producer.headroom();
        if headroom <= want + READ_MARGIN_BYTES {
            if self.options.debug_ring_buffers {
                debug!("{}: ring buffer headroom {headroom} bytes, skipping read", self.name);
            }
            thread::sleep(BACKPRESSURE_SLEEP);
            return Ok(ReadStatus::NoEvent);
        }
        if self.options.debug_ring_buffers {
            debug!(
                "{}: ring buffer headroom is {headroom} bytes, reading up to {want} bytes",
                self.name
            );
        }

        let buf = producer.reserve(want)?;
        let start = Instant::now();
        let status = lock(&self.device).read_event(self.read_timeout_ms, buf)?;

        if let ReadStatus::Event(n) = status {
            producer.commit(n);
            self.status.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

            if self.options.debug_rates {
                let secs = start.elapsed().as_secs_f64().max(1e-9);
                info!(
                    "Read {} in {:.0} us ({:.1} MiB/s) from {}",
                    format_bytes(n),
                    secs * 1e6,
                    n as f64 / 1024.0 / 1024.0 / secs,
                    self.name
                );
            }
            if self.options.debug_ring_buffers {
                debug!("{}: ring buffer headroom is now {} bytes", self.name, producer.headroom());
            }
        }
        Ok(status)
    }

    /// Keep reading until the run stops or the board fails.
    pub fn run_loop(&mut self) {
        self.status.set_state(ReaderState::Running);
        self.last_sleep = Instant::now();

        while !self.signals.stop_requested() {
            match self.read_once() {
                Ok(ReadStatus::NoEvent) => {
                    thread::sleep(NO_EVENT_SLEEP);
                    self.last_sleep = Instant::now();
                }
                Ok(ReadStatus::Event(_)) => {
                    // let the consumer side in now and then
                    if self.last_sleep.elapsed() > YIELD_AFTER {
                        thread::sleep(YIELD_SLEEP);
                        self.last_sleep = Instant::now();
                    }
                }
                Err(e) => {
                    error!("Reading from {} failed: {e}", self.name);
                    self.status.set_state(ReaderState::Error);
                    return;
                }
            }
        }
        self.status.set_state(ReaderState::Stopped);
    }

    /// Whole worker lifetime: configure, wait for the go-ahead, arm, read.
    pub fn run(mut self) {
        info!(
            "Spawned thread to configure/read out {} (board {:02})",
            self.name, self.board_id
        );

        if self.configure().is_err() || !self.wait_for_arming() || self.arm().is_err() {
            return;
        }
        if self.options.enable_readout {
            self.run_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::{peek_event, Peek};
    use crate::ring_buffer::RingBuffer;
    use crate::settings::{Param, ParamBag};
    use crate::sim::{SimConfig, SimDigitizer};

    const RING_BYTES: usize = 4 << 20;

    fn device(config: SimConfig) -> Arc<Mutex<Dig2>> {
        Arc::new(Mutex::new(Dig2::from_transport(
            "vx01",
            Box::new(SimDigitizer::new("vx01", config)),
        )))
    }

    fn options() -> ReaderOptions {
        ReaderOptions {
            enable_readout: true,
            read_data: true,
            ..Default::default()
        }
    }

    fn reader(
        config: SimConfig,
        settings: BoardSettings,
        ring: &RingBuffer,
    ) -> (RingBufferReader, Arc<RunSignals>) {
        let signals = Arc::new(RunSignals::new());
        let reader = RingBufferReader::new(
            0,
            device(config),
            settings,
            Arc::new(Mutex::new(BoardReadback::default())),
            options(),
            ring.producer(),
            Arc::new(ReaderStatus::default()),
            Arc::clone(&signals),
        );
        (reader, signals)
    }

    fn scope_settings() -> BoardSettings {
        let mut set = BoardSettings::default();
        set.set_str(Param::Hostname, "vx01").unwrap();
        set.set_u32(Param::ReadTimeoutMs, 20).unwrap();
        set
    }

    #[test]
    fn firmware_must_match_the_configured_mode() {
        let mut rdb = BoardReadback::default();
        let set = scope_settings();

        let dev = device(SimConfig::default());
        let fw = validate_firmware(&mut lock(&dev), &set, &mut rdb).unwrap();
        assert_eq!(fw, FirmwareType::Scope);
        assert_eq!(rdb.model_name().unwrap(), "VX2740");

        let dev = device(SimConfig::open_dpp());
        let err = validate_firmware(&mut lock(&dev), &set, &mut rdb).unwrap_err();
        assert!(matches!(err, DaqError::FirmwareModeMismatch { configured: "scope", .. }));

        let mut user = set.clone();
        user.set_bool(Param::ScopeMode, false).unwrap();
        let dev = device(SimConfig {
            firmware_version: "2021010100".to_string(),
            ..SimConfig::open_dpp()
        });
        let err = validate_firmware(&mut lock(&dev), &user, &mut rdb).unwrap_err();
        assert!(matches!(err, DaqError::FirmwareTooOld { min: MIN_USER_MODE_FW, .. }));

        let dev = device(SimConfig {
            firmware_type: "DPP_PHA".to_string(),
            ..SimConfig::default()
        });
        let err = validate_firmware(&mut lock(&dev), &user, &mut rdb).unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedFirmware { .. }));
    }

    #[test]
    fn configure_arm_and_read_into_the_ring() {
        let mut ring = RingBuffer::new(RING_BYTES);
        let (mut reader, _signals) = reader(SimConfig::default(), scope_settings(), &ring);

        reader.configure().unwrap();
        assert_eq!(reader.state(), ReaderState::Configured);
        reader.arm().unwrap();
        assert_eq!(reader.state(), ReaderState::Armed);

        assert_eq!(reader.read_once().unwrap(), ReadStatus::NoEvent);
        lock(&reader.device).send_sw_trigger().unwrap();
        let n = match reader.read_once().unwrap() {
            ReadStatus::Event(n) => n,
            ReadStatus::NoEvent => panic!("expected an event"),
        };
        assert_eq!(ring.level(), n);
        match peek_event(&mut ring) {
            Peek::Complete { header, size_bytes } => {
                assert_eq!(size_bytes, n);
                assert_eq!(header.event_counter, 0);
                assert!(header.is_waveform());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn settings_failure_is_an_error_state() {
        let ring = RingBuffer::new(RING_BYTES);
        let mut config = SimConfig::default();
        config
            .stuck_values
            .insert("/ch/3/par/DcOffset".to_string(), "12".to_string());
        let (mut reader, _signals) = reader(config, scope_settings(), &ring);
        assert!(reader.configure().is_err());
        assert_eq!(reader.state(), ReaderState::Error);
    }

    #[test]
    fn small_ring_is_rejected() {
        let ring = RingBuffer::new(4096);
        let (mut reader, _signals) = reader(SimConfig::default(), scope_settings(), &ring);
        assert!(matches!(reader.configure(), Err(DaqError::Configure(_))));
    }

    #[test]
    fn worker_thread_stops_on_request() {
        let ring = RingBuffer::new(RING_BYTES);
        let config = SimConfig {
            trigger_rate_hz: 200.0,
            ..SimConfig::default()
        };
        let (reader, signals) = reader(config, scope_settings(), &ring);
        let status = Arc::clone(&reader.status);

        let handle = thread::spawn(move || reader.run());
        let armed = crate::utils::poll_until(Duration::from_secs(5), ARM_POLL, || {
            (status.state() == ReaderState::Configured).then_some(())
        });
        assert!(armed.is_some());
        signals.allow_arming();

        let got_data = crate::utils::poll_until(Duration::from_secs(5), ARM_POLL, || {
            (!ring.is_empty()).then_some(())
        });
        assert!(got_data.is_some());

        signals.request_stop();
        handle.join().unwrap();
        assert_eq!(status.state(), ReaderState::Stopped);
        assert!(status.bytes_read() > 0);
    }

    #[test]
    fn aborted_arming_leaves_the_board_unarmed() {
        let ring = RingBuffer::new(RING_BYTES);
        let (reader, signals) = reader(SimConfig::default(), scope_settings(), &ring);
        let status = Arc::clone(&reader.status);
        signals.abort_arming();
        thread::spawn(move || reader.run()).join().unwrap();
        assert_eq!(status.state(), ReaderState::Configured);
    }
}
