//! Controller for one group of boards.
//!
//! Owns the board connections, one ring buffer per board and the readout
//! workers, and drives them through begin-of-run and end-of-run. Between
//! the two, [`GroupController::is_event_ready`],
//! [`GroupController::write_data`], [`GroupController::write_metadata`] and
//! [`GroupController::check_errors`] are all the outside world calls.

use crate::aligner::{peek_event, EventAligner, Peek, ReadyEvent};
use crate::dig2::Dig2;
use crate::digitizer_params;
use crate::error::{DaqError, DaqResult};
use crate::event::{decode_event, ByteOrder};
use crate::felib::Connector;
use crate::params::FirmwareType;
use crate::reader::{
    validate_firmware, ReaderOptions, ReaderState, ReaderStatus, RingBufferReader, RunSignals,
};
use crate::ring_buffer::RingBuffer;
use crate::settings::BoardErrors;
use crate::sink::{Bank, GroupEvent};
use crate::store::SettingsStore;
use crate::sync::FeSettings;
use crate::utils::{lock, poll_until};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);
const INLINE_CONFIGURE_TIMEOUT: Duration = Duration::from_secs(1);
const BARRIER_POLL: Duration = Duration::from_millis(1);
const TICKS_PER_SECOND: f64 = 1.25e8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Connecting,
    Configuring,
    WaitingForConfigured,
    Arming,
    WaitingForArmed,
    Running,
    Draining,
}

/// What the status display shows for one board.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardSummary {
    pub board_id: usize,
    pub name: String,
    pub state: ReaderState,
    pub ring_level: usize,
    pub bytes_read: u64,
    pub alarm: bool,
}

struct Board {
    name: String,
    device: Option<Arc<Mutex<Dig2>>>,
    status: Arc<ReaderStatus>,
    worker: Option<JoinHandle<()>>,
    scope_mode: bool,
    open_fw: bool,
    alarm: bool,
}

impl Board {
    fn new(board_id: usize) -> Self {
        Self {
            name: format!("board {board_id:02}"),
            device: None,
            status: Arc::new(ReaderStatus::default()),
            worker: None,
            scope_mode: true,
            open_fw: false,
            alarm: false,
        }
    }

    fn connected_device(&self) -> Option<&Arc<Mutex<Dig2>>> {
        self.device
            .as_ref()
            .filter(|dev| lock(dev).is_connected())
    }
}

pub struct GroupController {
    connector: Box<dyn Connector>,
    settings: FeSettings,
    group_index: Option<usize>,
    enable_data_readout: bool,
    ring_capacity: usize,
    boards: Vec<Board>,
    rings: Vec<RingBuffer>,
    names: Vec<String>,
    /// Workers driven inline when readout is single threaded.
    inline_readers: Vec<RingBufferReader>,
    aligner: EventAligner,
    signals: Arc<RunSignals>,
    ready: Option<ReadyEvent>,
    state: RunState,
}

impl GroupController {
    pub fn new(
        connector: Box<dyn Connector>,
        store: Box<dyn SettingsStore>,
        group_index: Option<usize>,
        ring_capacity: usize,
        enable_data_readout: bool,
    ) -> Self {
        Self {
            connector,
            settings: FeSettings::new(store),
            group_index,
            enable_data_readout,
            ring_capacity,
            boards: Vec::new(),
            rings: Vec::new(),
            names: Vec::new(),
            inline_readers: Vec::new(),
            aligner: EventAligner::default(),
            signals: Arc::new(RunSignals::new()),
            ready: None,
            state: RunState::Idle,
        }
    }

    pub fn settings(&self) -> &FeSettings {
        &self.settings
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn group_index(&self) -> Option<usize> {
        self.group_index
    }

    /// Trigger mask stamped on every event of this group.
    pub fn trigger_mask(&self) -> u16 {
        self.group_index.map_or(0, |i| i as u16)
    }

    /// A corrupt event asked for the run to be stopped.
    pub fn emergency_stop_requested(&self) -> bool {
        self.aligner.stop_requested()
    }

    pub fn board_summaries(&self) -> Vec<BoardSummary> {
        self.boards
            .iter()
            .enumerate()
            .map(|(board_id, board)| BoardSummary {
                board_id,
                name: board.name.clone(),
                state: board.status.state(),
                ring_level: self.rings.get(board_id).map_or(0, RingBuffer::level),
                bytes_read: board.status.bytes_read(),
                alarm: board.alarm,
            })
            .collect()
    }

    /// Load settings, make a ring buffer per board and connect to every
    /// enabled board.
    pub fn init(&mut self) -> DaqResult<()> {
        self.state = RunState::Initializing;
        self.settings.init_store(self.group_index)?;
        self.settings.sync_settings_structs()?;
        self.resize_boards();

        let result = self.connect_to_boards();
        self.settings.handle_board_readback_structs()?;
        self.state = RunState::Idle;
        result
    }

    fn resize_boards(&mut self) {
        let n = self.settings.num_boards();
        while self.boards.len() < n {
            let board_id = self.boards.len();
            self.boards.push(Board::new(board_id));
            self.rings.push(RingBuffer::new(self.ring_capacity));
            self.names.push(format!("board {board_id:02}"));
        }
    }

    /// Connect to enabled boards that are not connected yet, and check
    /// their firmware.
    pub fn connect_to_boards(&mut self) -> DaqResult<()> {
        self.state = RunState::Connecting;

        for board_id in self.settings.boards_enabled()? {
            if self.boards[board_id].connected_device().is_some() {
                continue;
            }

            let hostname = self.settings.hostname(board_id)?;
            if hostname.is_empty() || hostname == "set hostname here" {
                error!("Set board {board_id}'s hostname/IP in the settings");
                return Err(DaqError::MissingHostname(board_id));
            }

            info!("Connecting to board {board_id:02} at {hostname}");
            let mut dev = Dig2::connect(self.connector.as_ref(), &hostname, false).map_err(|e| {
                error!("Failed to connect to board '{hostname}': {e}");
                e
            })?;

            let board = &mut self.boards[board_id];
            board.name = hostname.clone();
            board.scope_mode = self.settings.is_scope_mode(board_id)?;
            self.names[board_id] = hostname;

            let firmware = {
                let set = self.settings.board(board_id)?;
                let rdb = self.settings.readback(board_id)?;
                let mut rdb = lock(&rdb);
                validate_firmware(&mut dev, set, &mut rdb).map_err(|e| {
                    error!("{e}");
                    e
                })?
            };
            let board = &mut self.boards[board_id];
            board.open_fw = firmware == FirmwareType::DppOpen;
            board.device = Some(Arc::new(Mutex::new(dev)));
        }
        Ok(())
    }

    fn device(&self, board_id: usize) -> DaqResult<Arc<Mutex<Dig2>>> {
        self.boards
            .get(board_id)
            .and_then(Board::connected_device)
            .cloned()
            .ok_or(DaqError::UnknownBoard(board_id))
    }

    /// Configure every enabled board, wait until all are configured, then
    /// arm them and wait until all are armed.
    pub fn begin_of_run(&mut self, run_number: u32) -> DaqResult<()> {
        let start = Instant::now();
        if self.state == RunState::Running {
            self.end_of_run()?;
        }
        self.settings.sync_settings_structs()?;
        self.resize_boards();

        let merge = self.settings.group().merge_data_using_event_id;
        let multithreaded = self.settings.group().multithreaded_readout;
        self.aligner.reset(merge);
        self.ready = None;
        self.signals = Arc::new(RunSignals::new());

        let read_from = self.settings.boards_to_read_from()?;
        let mut any_not_scope = false;
        for &board_id in &read_from {
            any_not_scope |= !self.settings.is_scope_mode(board_id)?;
        }
        if self.enable_data_readout && merge && any_not_scope {
            let err = DaqError::MergeWithOpenFirmware;
            error!("{err}");
            return Err(err);
        }

        self.connect_to_boards()?;
        info!("Starting run {run_number}");

        let enabled = self.settings.boards_enabled()?;
        self.state = RunState::Configuring;
        if let Err(e) = self.start_readers(&enabled, &read_from, multithreaded) {
            self.abort_run();
            return Err(e);
        }

        self.state = RunState::WaitingForConfigured;
        let configured = self.wait_for_all(
            &enabled,
            "configured",
            if multithreaded { BARRIER_TIMEOUT } else { INLINE_CONFIGURE_TIMEOUT },
            |s| s == ReaderState::Configured,
            DaqError::Configure,
        );
        if let Err(e) = configured {
            error!("{e}");
            self.abort_run();
            return Err(e);
        }
        info!(
            "Took {:.3}ms to configure boards",
            start.elapsed().as_secs_f64() * 1e3
        );

        self.state = RunState::Arming;
        self.signals.allow_arming();
        if !multithreaded {
            for reader in &mut self.inline_readers {
                // the state carries the failure to the barrier below
                let _ = reader.arm();
            }
        }

        self.state = RunState::WaitingForArmed;
        let armed = self.wait_for_all(
            &enabled,
            "armed",
            if multithreaded { BARRIER_TIMEOUT } else { Duration::ZERO },
            |s| matches!(s, ReaderState::Armed | ReaderState::Running),
            DaqError::Arm,
        );
        if let Err(e) = armed {
            error!("{e}");
            self.abort_run();
            return Err(e);
        }

        self.settings.handle_board_readback_structs()?;
        if self.settings.group().debug_settings {
            self.log_parameters(&enabled);
        }
        self.state = RunState::Running;
        info!("All boards armed. End of begin-of-run procedure.");
        Ok(())
    }

    /// Drop stale data from the previous run and hand each enabled board
    /// to a reader.
    fn start_readers(&mut self, enabled: &[usize], read_from: &[usize], multithreaded: bool) -> DaqResult<()> {
        let group = self.settings.group().clone();
        self.inline_readers.clear();

        for &board_id in enabled {
            let device = self.device(board_id)?;
            let ring = &mut self.rings[board_id];
            let board = &mut self.boards[board_id];

            let read_data = read_from.contains(&board_id);
            let producer = if self.enable_data_readout && read_data {
                info!(
                    "Skipping over {} unused bytes in ring buffer for {}",
                    ring.level(),
                    board.name
                );
                ring.reset()?;
                ring.producer()
            } else {
                None
            };

            let options = ReaderOptions {
                enable_readout: self.enable_data_readout,
                read_data,
                debug_settings: group.debug_settings,
                debug_rates: group.debug_rates,
                debug_ring_buffers: group.debug_ring_buffers,
            };
            let reader = RingBufferReader::new(
                board_id,
                device,
                self.settings.board(board_id)?.clone(),
                self.settings.readback(board_id)?,
                options,
                producer,
                Arc::clone(&board.status),
                Arc::clone(&self.signals),
            );

            if multithreaded {
                board.status.set_state(ReaderState::Configuring);
                let handle = thread::Builder::new()
                    .name(format!("readout-{board_id:02}"))
                    .spawn(move || reader.run())
                    .map_err(|e| DaqError::Spawn {
                        board: board.name.clone(),
                        message: e.to_string(),
                    })?;
                board.worker = Some(handle);
            } else {
                let mut reader = reader;
                // the state carries the failure to the barrier
                let _ = reader.configure();
                self.inline_readers.push(reader);
            }
        }
        Ok(())
    }

    /// Poll reader states until every board is in an accepted state, any
    /// board is in error, or the timeout passes.
    fn wait_for_all(
        &self,
        enabled: &[usize],
        what: &'static str,
        timeout: Duration,
        accept: impl Fn(ReaderState) -> bool,
        on_error: fn(String) -> DaqError,
    ) -> DaqResult<()> {
        let outcome = poll_until(timeout, BARRIER_POLL, || {
            let mut all_okay = true;
            for &board_id in enabled {
                let board = &self.boards[board_id];
                let state = board.status.state();
                if state == ReaderState::Error {
                    return Some(Err(on_error(board.name.clone())));
                }
                all_okay &= accept(state);
            }
            all_okay.then_some(Ok(()))
        });

        outcome.unwrap_or(Err(DaqError::BarrierTimeout(what)))
    }

    fn log_parameters(&self, boards: &[usize]) {
        let devices: Vec<_> = boards
            .iter()
            .filter_map(|&id| self.device(id).ok().map(|dev| (id, dev)))
            .collect();
        let mut guards: Vec<_> = devices.iter().map(|(id, dev)| (*id, lock(dev))).collect();
        digitizer_params::log_all(guards.iter_mut().map(|(id, dev)| (*id, &mut **dev)), false);
    }

    /// Stop every worker of a begin-of-run that did not complete.
    fn abort_run(&mut self) {
        self.signals.abort_arming();
        self.signals.request_stop();
        self.join_workers();
        self.inline_readers.clear();

        for board in &self.boards {
            if let Some(device) = board.connected_device() {
                if let Err(e) = lock(device).stop_acq() {
                    debug!("Stopping {} after a failed start: {e}", board.name);
                }
            }
        }
        self.state = RunState::Idle;
    }

    fn join_workers(&mut self) {
        for board in &mut self.boards {
            if let Some(handle) = board.worker.take() {
                if handle.join().is_err() {
                    error!("Readout thread of {} panicked", board.name);
                }
            }
        }
    }

    /// Stop the workers and disarm every enabled board.
    pub fn end_of_run(&mut self) -> DaqResult<()> {
        self.state = RunState::Draining;
        self.signals.request_stop();
        self.join_workers();
        self.inline_readers.clear();

        for board_id in self.settings.boards_enabled()? {
            if let Ok(device) = self.device(board_id) {
                if let Err(e) = lock(&device).stop_acq() {
                    warn!("Failed to stop acquisition of {}: {e}", self.boards[board_id].name);
                }
            }
        }

        self.ready = None;
        self.state = RunState::Idle;
        info!("End of run");
        Ok(())
    }

    /// Whether a logical event can be written. With single-threaded
    /// readout this is also where the boards are read.
    pub fn is_event_ready(&mut self) -> bool {
        if !self.enable_data_readout || self.state != RunState::Running {
            return false;
        }

        for reader in &mut self.inline_readers {
            if reader.state() == ReaderState::Armed {
                if let Err(e) = reader.read_once() {
                    error!("Reading from board {} failed: {e}", reader.board_id());
                    self.boards[reader.board_id()]
                        .status
                        .set_state(ReaderState::Error);
                }
            }
        }

        let read_from = match self.settings.boards_to_read_from() {
            Ok(boards) => boards,
            Err(e) => {
                error!("{e}");
                return false;
            }
        };
        self.ready = self
            .aligner
            .is_event_ready(&mut self.rings, &read_from, &self.names);
        self.ready.is_some()
    }

    /// Take the ready logical event out of the ring buffers: one `D###`
    /// bank per contributing board.
    pub fn write_data(&mut self) -> DaqResult<Option<GroupEvent>> {
        if self.ready.is_none() && !self.is_event_ready() {
            return Ok(None);
        }
        let Some(ready) = self.ready.take() else {
            return Ok(None);
        };

        let debug_data = self.settings.group().debug_data;
        let mut event = GroupEvent {
            trigger_mask: self.trigger_mask(),
            banks: Vec::with_capacity(ready.boards.len()),
        };

        for &board_id in &ready.boards {
            let ring = &mut self.rings[board_id];
            let size_bytes = match peek_event(ring) {
                Peek::Complete { size_bytes, .. } => size_bytes,
                Peek::Corrupt { size_bytes } => {
                    return Err(DaqError::Corruption {
                        board: self.names[board_id].clone(),
                        size_bytes,
                    })
                }
                Peek::Empty | Peek::Partial => continue,
            };

            let data = ring.readable()[..size_bytes].to_vec();
            ring.consume(size_bytes);

            if debug_data {
                log_event_details(&self.names[board_id], &data);
            }
            event.banks.push(Bank::data_bank(board_id, data));
        }

        Ok(Some(event))
    }

    /// Periodic record of every board's acquisition status, temperatures
    /// and error flags. Boards that are disabled or unreachable report
    /// zeros.
    pub fn write_metadata(&mut self) -> DaqResult<GroupEvent> {
        let mut event = GroupEvent {
            trigger_mask: self.trigger_mask(),
            banks: Vec::with_capacity(self.settings.num_boards()),
        };

        for board_id in 0..self.settings.num_boards() {
            let mut words = [0u32; 4];
            if self.settings.is_board_enabled(board_id)? {
                if let Ok(device) = self.device(board_id) {
                    let mut dev = lock(&device);
                    let read = dev.get_acquisition_status().and_then(|status| {
                        let temps = dev.get_temperatures()?;
                        let flags = dev.get_error_flags()?;
                        Ok([status, temps.air_in as u32, temps.hottest_adc as u32, flags])
                    });
                    match read {
                        Ok(w) => words = w,
                        Err(e) => warn!("Failed to read metadata of {}: {e}", dev.name()),
                    }
                }
            }
            event.banks.push(Bank::metadata_bank(board_id, words));
        }
        Ok(event)
    }

    /// Poll error flags and LVDS state of every enabled board, raise or
    /// clear the per-board alarm and publish errors and readback.
    pub fn check_errors(&mut self) -> DaqResult<()> {
        for board_id in self.settings.boards_enabled()? {
            let Ok(device) = self.device(board_id) else {
                continue;
            };
            let open_fw = self.boards[board_id].open_fw;

            let (flags, io_reg, user_out, user_in) = {
                let mut dev = lock(&device);
                let flags = dev.get_error_flags()?;
                let io_reg: u16 = dev.get_dig("LVDSIOReg")?;
                let (user_out, user_in) = if open_fw {
                    (dev.get_user_register_u16(0x44)?, dev.get_user_register(0x48)?)
                } else {
                    (0, 0)
                };
                (flags, io_reg, user_out, user_in)
            };

            let rdb = self.settings.readback(board_id)?;
            lock(&rdb).set_lvds_readback(io_reg, user_out, user_in)?;

            let errors = BoardErrors::from_bitmask(flags);
            let board = &mut self.boards[board_id];
            if errors.bitmask != 0 && !board.alarm {
                warn!("{} reports errors: {}", board.name, errors.message);
                board.alarm = true;
            } else if errors.bitmask == 0 && board.alarm {
                info!("{} errors cleared", board.name);
                board.alarm = false;
            }
            self.settings.set_board_errors(board_id, errors);
        }

        self.settings.handle_board_errors_structs()?;
        self.settings.handle_board_readback_structs()?;
        Ok(())
    }

    /// Re-read the settings and write them to every enabled board now.
    pub fn force_write_settings(&mut self) -> DaqResult<()> {
        if self.state == RunState::Running {
            return Err(DaqError::Configure(
                "settings cannot be forced while a run is in progress".to_string(),
            ));
        }
        self.settings.sync_settings_structs()?;
        self.resize_boards();
        self.connect_to_boards()?;

        for board_id in self.settings.boards_enabled()? {
            let device = self.device(board_id)?;
            let mut dev = lock(&device);
            {
                let set = self.settings.board(board_id)?;
                let rdb = self.settings.readback(board_id)?;
                validate_firmware(&mut dev, set, &mut lock(&rdb))?;
            }
            if let Err(e) = self.settings.write_settings_to_board(board_id, &mut dev) {
                error!("Failure writing board settings for {}: {e}", dev.name());
                return Err(e.into());
            }
        }

        self.settings.handle_board_readback_structs()?;
        self.state = RunState::Idle;
        Ok(())
    }

    /// Send a software trigger to every enabled board.
    pub fn send_sw_trigger(&mut self) -> DaqResult<()> {
        for board_id in self.settings.boards_enabled()? {
            if let Ok(device) = self.device(board_id) {
                lock(&device).send_sw_trigger()?;
            }
        }
        Ok(())
    }

    /// Disarm and disconnect every board.
    pub fn shutdown(&mut self) -> DaqResult<()> {
        if self.state != RunState::Idle {
            self.end_of_run()?;
        }
        for board in &mut self.boards {
            if let Some(device) = board.device.take() {
                if let Err(e) = lock(&device).close() {
                    debug!("Closing {}: {e}", board.name);
                }
            }
        }
        Ok(())
    }
}

impl Drop for GroupController {
    fn drop(&mut self) {
        self.signals.abort_arming();
        self.signals.request_stop();
        self.join_workers();
    }
}

fn log_event_details(board: &str, data: &[u8]) {
    let event = match decode_event(data, ByteOrder::Host) {
        Ok(event) => event,
        Err(e) => {
            warn!("{board}: undecodable event: {e}");
            return;
        }
    };
    let header = &event.header;

    if !header.is_waveform() {
        info!(
            "{board}: special event of format 0x{:x}, {} bytes, flags 0x{:x}",
            header.format,
            header.size_bytes(),
            header.flags
        );
        return;
    }

    info!(
        "{board}: event {} of format 0x{:x}, {} bytes, channel mask 0x{:x}, trigger time {:.9} s",
        header.event_counter,
        header.format,
        header.size_bytes(),
        header.ch_enable_mask,
        header.trigger_time as f64 / TICKS_PER_SECOND
    );
    if header.ch_enable_mask != 0 {
        let first = header.ch_enable_mask.trailing_zeros() as usize;
        let mut samples = [0u16; 10];
        let n = event.extract_channel_samples(first, &mut samples);
        info!("{board}: first samples of channel {first}: {:?}", &samples[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode_event;
    use crate::settings::{BoardSettings, GroupSettings, Param, ParamBag};
    use crate::sim::{SimConfig, SimConnector};
    use crate::store::{ManualRecord, ManualStore};

    const RING_BYTES: usize = 4 << 20;

    fn board(host: &str) -> BoardSettings {
        let mut set = BoardSettings::default();
        set.set_str(Param::Hostname, host).unwrap();
        set.set_u32(Param::ReadTimeoutMs, 20).unwrap();
        set.set_u32(Param::WaveformLength, 64).unwrap();
        set
    }

    fn group(num_boards: usize, merge: bool, multithreaded: bool) -> GroupSettings {
        GroupSettings {
            num_boards,
            merge_data_using_event_id: merge,
            multithreaded_readout: multithreaded,
            ..GroupSettings::default()
        }
    }

    fn controller(
        connector: SimConnector,
        group: GroupSettings,
        boards: Vec<BoardSettings>,
    ) -> (GroupController, Arc<Mutex<ManualRecord>>) {
        let store = ManualStore::new(group, boards);
        let record = store.record();
        let ctl = GroupController::new(Box::new(connector), Box::new(store), Some(3), RING_BYTES, true);
        (ctl, record)
    }

    fn wait_for_event(ctl: &mut GroupController) -> GroupEvent {
        let event = poll_until(Duration::from_secs(5), Duration::from_millis(1), || {
            ctl.write_data().unwrap()
        });
        event.expect("no event arrived")
    }

    #[test]
    fn barrier_times_out_on_a_stuck_board() {
        let (mut ctl, _) = controller(
            SimConnector::new(SimConfig::default()),
            group(2, false, true),
            vec![board("vx01"), board("vx02")],
        );
        ctl.init().unwrap();
        ctl.boards[0].status.set_state(ReaderState::Configured);
        ctl.boards[1].status.set_state(ReaderState::Configuring);

        let started = Instant::now();
        let result = ctl.wait_for_all(
            &[0, 1],
            "configured",
            Duration::from_millis(20),
            |s| s == ReaderState::Configured,
            DaqError::Configure,
        );
        assert!(matches!(result, Err(DaqError::BarrierTimeout("configured"))));
        assert!(started.elapsed() >= Duration::from_millis(20));

        // an error wins over waiting and names the board
        ctl.boards[1].status.set_state(ReaderState::Error);
        match ctl.wait_for_all(
            &[0, 1],
            "configured",
            Duration::from_secs(5),
            |s| s == ReaderState::Configured,
            DaqError::Configure,
        ) {
            Err(DaqError::Configure(name)) => assert_eq!(name, ctl.boards[1].name),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_hostname_fails_init() {
        let (mut ctl, _) = controller(
            SimConnector::new(SimConfig::default()),
            group(1, false, true),
            vec![BoardSettings::default()],
        );
        assert!(matches!(ctl.init(), Err(DaqError::MissingHostname(0))));
    }

    #[test]
    fn multithreaded_run_delivers_data_banks() {
        let connector = SimConnector::new(SimConfig::default());
        let settings = GroupSettings {
            debug_settings: true,
            ..group(2, false, true)
        };
        let (mut ctl, record) = controller(connector, settings, vec![board("vx01"), board("vx02")]);
        ctl.init().unwrap();
        ctl.begin_of_run(1).unwrap();
        assert_eq!(ctl.state(), RunState::Running);

        ctl.send_sw_trigger().unwrap();
        let event = wait_for_event(&mut ctl);
        assert_eq!(event.trigger_mask, 3);
        assert_eq!(event.banks.len(), 1);
        let bank = &event.banks[0];
        assert!(bank.name == "D000" || bank.name == "D001");
        let decoded = decode_event(&bank.data, ByteOrder::Host).unwrap();
        assert_eq!(decoded.header.size_bytes() as usize, bank.data.len());
        assert!(decoded.header.is_waveform());

        ctl.end_of_run().unwrap();
        assert_eq!(ctl.state(), RunState::Idle);
        assert!(ctl
            .board_summaries()
            .iter()
            .all(|b| b.state == ReaderState::Stopped));

        assert_eq!(
            lock(&record).readback[&0].model_name().unwrap(),
            "VX2740"
        );
    }

    #[test]
    fn merged_events_carry_every_board() {
        let connector = SimConnector::new(SimConfig::default());
        let (mut ctl, _) = controller(connector, group(2, true, false), vec![board("vx01"), board("vx02")]);
        ctl.init().unwrap();
        ctl.begin_of_run(7).unwrap();

        ctl.send_sw_trigger().unwrap();
        let event = wait_for_event(&mut ctl);
        let names: Vec<_> = event.banks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["D000", "D001"]);
        for bank in &event.banks {
            let decoded = decode_event(&bank.data, ByteOrder::Host).unwrap();
            assert_eq!(decoded.header.event_counter, 0);
        }
        ctl.end_of_run().unwrap();
    }

    #[test]
    fn merge_with_open_firmware_is_rejected() {
        let connector = SimConnector::new(SimConfig::default())
            .with_board("vx02", SimConfig::open_dpp());
        let mut user = board("vx02");
        user.set_bool(Param::ScopeMode, false).unwrap();
        let (mut ctl, _) = controller(connector, group(2, true, true), vec![board("vx01"), user]);
        ctl.init().unwrap();
        assert!(matches!(
            ctl.begin_of_run(1),
            Err(DaqError::MergeWithOpenFirmware)
        ));
        assert_eq!(ctl.state(), RunState::Idle);
    }

    #[test]
    fn configure_failure_names_the_board() {
        let mut stuck = SimConfig::default();
        stuck
            .stuck_values
            .insert("/ch/0/par/DcOffset".to_string(), "1".to_string());
        let connector = SimConnector::new(SimConfig::default()).with_board("vx02", stuck);
        let (mut ctl, _) = controller(connector, group(2, false, true), vec![board("vx01"), board("vx02")]);
        ctl.init().unwrap();

        match ctl.begin_of_run(1) {
            Err(DaqError::Configure(name)) => assert_eq!(name, "vx02"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctl.state(), RunState::Idle);
        // the healthy board never got armed
        let summaries = ctl.board_summaries();
        assert_ne!(summaries[0].state, ReaderState::Armed);
        assert_ne!(summaries[0].state, ReaderState::Running);
    }

    #[test]
    fn metadata_and_error_polling() {
        let flagged = SimConfig {
            error_flags: 1 << 1,
            ..SimConfig::default()
        };
        let connector = SimConnector::new(SimConfig::default()).with_board("vx02", flagged);
        let mut disabled = board("vx03");
        disabled.set_bool(Param::Enable, false).unwrap();
        let (mut ctl, record) = controller(
            connector,
            group(3, false, true),
            vec![board("vx01"), board("vx02"), disabled],
        );
        ctl.init().unwrap();

        let meta = ctl.write_metadata().unwrap();
        let words: Vec<_> = meta.banks.iter().map(|b| b.metadata_words().unwrap()).collect();
        assert_eq!(meta.banks[2].name, "M002");
        assert_eq!(words[0], [0, 31, 52, 0]);
        assert_eq!(words[1][3], 1 << 1);
        assert_eq!(words[2], [0; 4]);

        ctl.check_errors().unwrap();
        let summaries = ctl.board_summaries();
        assert!(!summaries[0].alarm);
        assert!(summaries[1].alarm);

        let record = lock(&record);
        assert_eq!(record.errors[&1].bitmask, 1 << 1);
        assert_eq!(record.errors[&1].message, "Initialization fail. ");
        assert_eq!(record.errors[&0].bitmask, 0);
    }

    #[test]
    fn forced_write_applies_settings() {
        let connector = SimConnector::new(SimConfig::default());
        let mut set = board("vx01");
        set.set_u32(Param::WaveformLength, 2048).unwrap();
        let (mut ctl, _) = controller(connector, group(1, false, true), vec![set]);
        ctl.init().unwrap();
        ctl.force_write_settings().unwrap();

        let device = ctl.device(0).unwrap();
        assert_eq!(lock(&device).getvalue("/par/RecordLengthS").unwrap(), "2048");
    }

    #[test]
    fn no_readout_mode_arms_without_data() {
        let store = ManualStore::new(group(1, false, true), vec![board("vx01")]);
        let mut ctl = GroupController::new(
            Box::new(SimConnector::new(SimConfig::default())),
            Box::new(store),
            None,
            RING_BYTES,
            false,
        );
        ctl.init().unwrap();
        ctl.begin_of_run(1).unwrap();
        assert_eq!(ctl.trigger_mask(), 0);
        assert!(!ctl.is_event_ready());
        assert_eq!(ctl.board_summaries()[0].state, ReaderState::Armed);
        ctl.shutdown().unwrap();
    }
}
