//! Simulated VX2740 behind the [`Transport`] contract.
//!
//! Holds a parameter tree and a user-register file, accepts the acquisition
//! commands, and generates triggers at a fixed rate once running. Raw reads
//! deliver network-order events; decoded reads fill the scope and open DPP
//! structs. Values listed in [`SimConfig::stuck_values`] are what the board
//! reports no matter what was written.

use crate::event::{pack_waveform_event, ByteOrder, NUM_CHANNELS};
use crate::felib::{
    Connector, Endpoint, FELibReturn, ScopeEvent, Transport, UserEvent, USER_WAVEFORM_MAX_SAMPLES,
};
use log::debug;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

const TRG_OUT_MODES: &[&str] = &[
    "Disabled",
    "TRGIN",
    "P0",
    "SwTrg",
    "LVDS",
    "ITLA",
    "ITLB",
    "ITLA_AND_ITLB",
    "ITLA_OR_ITLB",
    "EncodedClkIn",
    "Run",
    "RefClk",
    "TestPulse",
    "Busy",
    "UserTrgout",
    "Fixed0",
    "Fixed1",
    "SyncIn",
    "SIN",
    "GPIO",
    "AcceptTrg",
    "TrgClk",
];

const TRIGGER_ID_MODES: &[&str] = &["TriggerCnt", "EventCnt", "LVDSpattern"];

/// Board clock used for trigger time stamps.
const TICKS_PER_SECOND: f64 = 125e6;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub firmware_type: String,
    pub firmware_version: String,
    pub model_name: String,
    /// Value of user register 0x0 on open DPP firmware.
    pub user_fw_revision: u32,
    /// Triggers per second once running. Zero means software triggers only.
    pub trigger_rate_hz: f64,
    pub error_flags: u32,
    pub seed: u64,
    pub stuck_values: HashMap<String, String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            firmware_type: "Scope".to_string(),
            firmware_version: "2023030100".to_string(),
            model_name: "VX2740".to_string(),
            user_fw_revision: 2022102602,
            trigger_rate_hz: 0.0,
            error_flags: 0,
            seed: 0x2740,
            stuck_values: HashMap::new(),
        }
    }
}

impl SimConfig {
    pub fn open_dpp() -> Self {
        Self {
            firmware_type: "DPP_OPEN".to_string(),
            ..Self::default()
        }
    }
}

/// Opens simulated boards. Hosts without their own entry get the default
/// configuration.
#[derive(Clone, Debug, Default)]
pub struct SimConnector {
    default: SimConfig,
    per_host: HashMap<String, SimConfig>,
}

impl SimConnector {
    pub fn new(default: SimConfig) -> Self {
        Self {
            default,
            per_host: HashMap::new(),
        }
    }

    pub fn with_board(mut self, hostname: &str, config: SimConfig) -> Self {
        self.per_host.insert(hostname.to_string(), config);
        self
    }
}

impl Connector for SimConnector {
    fn open(&self, url: &str) -> Result<Box<dyn Transport>, FELibReturn> {
        let host = url
            .strip_prefix("dig2://")
            .map(|rest| rest.trim_end_matches("/?monitor"))
            .unwrap_or_default();
        if host.is_empty() {
            return Err(FELibReturn::DevNotFound);
        }
        let config = self.per_host.get(host).unwrap_or(&self.default).clone();
        Ok(Box::new(SimDigitizer::new(host, config)))
    }
}

pub struct SimDigitizer {
    name: String,
    config: SimConfig,
    params: HashMap<String, String>,
    allowed: HashMap<String, Vec<String>>,
    registers: HashMap<u32, u32>,
    lvds_masks: [u64; 16],
    endpoint: Option<Endpoint>,
    armed: bool,
    running: bool,
    run_start: Instant,
    triggers_sent: u64,
    pending_sw_triggers: u64,
    event_counter: u32,
    user_channel: usize,
    rng: StdRng,
    last_error: String,
    closed: bool,
}

impl SimDigitizer {
    pub fn new(name: &str, config: SimConfig) -> Self {
        let mut params = HashMap::new();
        let mut par = |path: String, value: &str| {
            params.insert(path, value.to_string());
        };

        for (name, value) in [
            ("FwType", config.firmware_type.as_str()),
            ("cupver", config.firmware_version.as_str()),
            ("ModelName", config.model_name.as_str()),
            ("StartSource", ""),
            ("AcqTriggerSource", ""),
            ("RunDelay", "0"),
            ("ITLAMainLogic", "OR"),
            ("ITLAPairLogic", "NONE"),
            ("ITLAMajorityLev", "0"),
            ("ITLAMask", "0"),
            ("ITLBMainLogic", "OR"),
            ("ITLBPairLogic", "NONE"),
            ("ITLBMajorityLev", "0"),
            ("ITLBMask", "0"),
            ("IOlevel", "NIM"),
            ("TrgOutMode", "Disabled"),
            ("ClockSource", "Internal"),
            ("EnClockOutFP", "True"),
            ("GPIOMode", "Disabled"),
            ("SyncOutMode", "Disabled"),
            ("EnOffsetCalibration", "True"),
            ("BusyInSource", "Disabled"),
            ("VetoSource", "Disabled"),
            ("VetoWidth", "0"),
            ("VetoPolarity", "ActiveHigh"),
            ("LVDSIOReg", "0"),
            ("TestPulsePeriod", "100000"),
            ("TestPulseWidth", "0"),
            ("TestPulseLowLevel", "0"),
            ("TestPulseHighLevel", "0"),
            ("TriggerDelayS", "0"),
            ("RecordLengthS", "1024"),
            ("EnTriggerOverlap", "False"),
            ("PreTriggerS", "100"),
            ("TriggerIDMode", "TriggerCnt"),
            ("TempSensAirIn", "31.5"),
            ("TempSensAirOut", "38.0"),
            ("TempSensHottestADC", "52.25"),
            ("MaxRawDataSize", "1048576"),
            ("NumCh", "64"),
            ("SerialNum", "25380"),
            ("ADC_Nbit", "16"),
            ("ADC_SamplRate", "125"),
        ] {
            par(format!("/par/{name}"), value);
        }
        par("/par/ErrorFlags".to_string(), &config.error_flags.to_string());

        for ch in 0..NUM_CHANNELS {
            for (name, value) in [
                ("ChEnable", "True"),
                ("DcOffset", "50"),
                ("WaveDataSource", "ADC_DATA"),
                ("TriggerThrMode", "Absolute"),
                ("TriggerThr", "0"),
                ("SelfTriggerEdge", "FALL"),
                ("SelfTriggerWidth", "0"),
            ] {
                par(format!("/ch/{ch}/par/{name}"), value);
            }
        }
        for quartet in 0..4 {
            par(format!("/lvds/{quartet}/par/LVDSDirection"), "Input");
            par(format!("/lvds/{quartet}/par/LVDSMode"), "SelfTriggers");
        }
        for group in 0..4 {
            par(format!("/vga/{group}/par/VGAGain"), "0");
        }

        let allowed = [
            ("/par/TrgOutMode", TRG_OUT_MODES),
            ("/par/TriggerIDMode", TRIGGER_ID_MODES),
        ]
        .into_iter()
        .map(|(path, values)| {
            (
                path.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect();

        let mut registers = HashMap::new();
        if config.firmware_type == "DPP_OPEN" {
            registers.insert(0x0, config.user_fw_revision);
            registers.insert(0x4, 3);
        }

        Self {
            name: name.to_string(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            params,
            allowed,
            registers,
            lvds_masks: [0; 16],
            endpoint: None,
            armed: false,
            running: false,
            run_start: Instant::now(),
            triggers_sent: 0,
            pending_sw_triggers: 0,
            event_counter: 0,
            user_channel: 0,
            last_error: String::new(),
            closed: false,
        }
    }

    fn fail<T>(&mut self, code: FELibReturn, message: String) -> Result<T, FELibReturn> {
        self.last_error = message;
        Err(code)
    }

    fn check_open(&mut self) -> Result<(), FELibReturn> {
        if self.closed {
            return self.fail(FELibReturn::InvalidHandle, "Connection closed".to_string());
        }
        Ok(())
    }

    fn param_u32(&self, path: &str, default: u32) -> u32 {
        self.params
            .get(path)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn acquisition_status(&self) -> u32 {
        match (self.armed, self.running) {
            (_, true) => 3,
            (true, false) => 1,
            _ => 0,
        }
    }

    fn start_run(&mut self) {
        self.running = true;
        self.run_start = Instant::now();
        self.triggers_sent = 0;
    }

    fn enabled_mask(&self) -> u64 {
        (0..NUM_CHANNELS)
            .filter(|ch| {
                self.params
                    .get(&format!("/ch/{ch}/par/ChEnable"))
                    .is_some_and(|v| v.eq_ignore_ascii_case("true"))
            })
            .fold(0u64, |mask, ch| mask | (1 << ch))
    }

    /// Claim the next trigger, waiting up to `timeout_ms` for one to be due.
    fn next_trigger(&mut self, timeout_ms: u32) -> Result<u64, FELibReturn> {
        if !self.running {
            thread::sleep(Duration::from_millis(u64::from(timeout_ms.min(5))));
            return Err(FELibReturn::Timeout);
        }

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let elapsed = self.run_start.elapsed().as_secs_f64();
            let due = (elapsed * self.config.trigger_rate_hz) as u64;
            if self.pending_sw_triggers > 0 {
                self.pending_sw_triggers -= 1;
                break;
            }
            if due > self.triggers_sent {
                self.triggers_sent += 1;
                break;
            }
            if Instant::now() >= deadline {
                return Err(FELibReturn::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }

        let ticks = (self.run_start.elapsed().as_secs_f64() * TICKS_PER_SECOND) as u64;
        Ok(ticks)
    }

    /// Flat baseline with noise and one negative pulse after the pre-trigger.
    fn fill_waveform(&mut self, out: &mut [u16]) {
        let pre = self.param_u32("/par/PreTriggerS", 100) as usize;
        let amplitude = self.rng.random_range(200..2000u16);
        for (i, sample) in out.iter_mut().enumerate() {
            let mut value = 32000u16 + self.rng.random_range(0..8u16);
            if i >= pre {
                let dt = (i - pre) as f64;
                value -= (f64::from(amplitude) * (-dt / 20.0).exp()) as u16;
            }
            *sample = value;
        }
    }

    fn require_endpoint(&mut self, wanted: Endpoint) -> Result<(), FELibReturn> {
        if self.endpoint == Some(wanted) {
            Ok(())
        } else {
            self.fail(
                FELibReturn::InvalidHandle,
                format!("Endpoint {} is not active", wanted.path()),
            )
        }
    }
}

impl Transport for SimDigitizer {
    fn get_value(&mut self, path: &str, value: &mut String) -> Result<(), FELibReturn> {
        self.check_open()?;

        if let Some(stuck) = self.config.stuck_values.get(path) {
            *value = stuck.clone();
            return Ok(());
        }

        match path {
            "/par/AcquisitionStatus" => {
                *value = self.acquisition_status().to_string();
                Ok(())
            }
            "/par/LVDSTrgMask" => match value.trim().parse::<usize>() {
                Ok(line) if line < self.lvds_masks.len() => {
                    *value = self.lvds_masks[line].to_string();
                    Ok(())
                }
                _ => self.fail(
                    FELibReturn::InvalidParam,
                    format!("Bad LVDS line '{value}'"),
                ),
            },
            _ => match self.params.get(path) {
                Some(v) => {
                    *value = v.clone();
                    Ok(())
                }
                None => self.fail(FELibReturn::InvalidParam, format!("No parameter {path}")),
            },
        }
    }

    fn set_value(&mut self, path: &str, value: &str) -> Result<(), FELibReturn> {
        self.check_open()?;

        if path == "/endpoint/par/activeendpoint" {
            return Ok(());
        }

        if path == "/par/LVDSTrgMask" {
            let parsed = value
                .split_once('=')
                .and_then(|(line, mask)| Some((line.trim().parse::<usize>().ok()?, mask.trim().parse::<u64>().ok()?)));
            return match parsed {
                Some((line, mask)) if line < self.lvds_masks.len() => {
                    self.lvds_masks[line] = mask;
                    Ok(())
                }
                _ => self.fail(FELibReturn::InvalidParam, format!("Bad LVDS mask '{value}'")),
            };
        }

        if !self.params.contains_key(path) {
            return self.fail(FELibReturn::InvalidParam, format!("No parameter {path}"));
        }

        let stored = if let Some(allowed) = self.allowed.get(path) {
            match allowed.iter().find(|a| a.eq_ignore_ascii_case(value)) {
                Some(canonical) => canonical.clone(),
                None => {
                    return self.fail(
                        FELibReturn::InvalidParam,
                        format!("Value {value} not allowed for {path}"),
                    )
                }
            }
        } else if path == "/par/TestPulsePeriod" {
            match value.parse::<f64>() {
                Ok(ns) => format!("{}", ns.round() as u64),
                Err(_) => {
                    return self.fail(FELibReturn::InvalidParam, format!("Bad period '{value}'"))
                }
            }
        } else {
            value.to_string()
        };

        self.params.insert(path.to_string(), stored);
        Ok(())
    }

    fn get_allowed_values(&mut self, path: &str) -> Result<Vec<String>, FELibReturn> {
        self.check_open()?;
        match self.allowed.get(path) {
            Some(values) => Ok(values.clone()),
            None => self.fail(
                FELibReturn::InvalidParam,
                format!("No allowed values for {path}"),
            ),
        }
    }

    fn get_user_register(&mut self, address: u32) -> Result<u32, FELibReturn> {
        self.check_open()?;
        Ok(self.registers.get(&address).copied().unwrap_or(0))
    }

    fn set_user_register(&mut self, address: u32, value: u32) -> Result<(), FELibReturn> {
        self.check_open()?;
        // 0x40 loads the FIR coefficients and clears itself
        if address != 0x40 {
            self.registers.insert(address, value);
        }
        Ok(())
    }

    fn send_command(&mut self, path: &str) -> Result<(), FELibReturn> {
        self.check_open()?;
        match path {
            "/cmd/reset" => {
                self.armed = false;
                self.running = false;
            }
            "/cmd/cleardata" => self.pending_sw_triggers = 0,
            "/cmd/armacquisition" => {
                self.armed = true;
                self.event_counter = 0;
                let start = self.params.get("/par/StartSource").cloned().unwrap_or_default();
                // any hardware start source is taken to fire straight away
                if !start.is_empty() && !start.split('|').all(|s| s == "SWcmd") {
                    self.start_run();
                }
            }
            "/cmd/swstartacquisition" => {
                if self.armed {
                    self.start_run();
                }
            }
            "/cmd/disarmacquisition" => {
                self.armed = false;
                self.running = false;
            }
            "/cmd/sendswtrigger" => {
                if self.running {
                    self.pending_sw_triggers += 1;
                }
            }
            _ => return self.fail(FELibReturn::Command, format!("Unknown command {path}")),
        }
        debug!("{}: {path}", self.name);
        Ok(())
    }

    fn set_read_data_format(&mut self, endpoint: Endpoint) -> Result<(), FELibReturn> {
        self.check_open()?;
        if endpoint == Endpoint::OpenDpp && self.config.firmware_type != "DPP_OPEN" {
            return self.fail(
                FELibReturn::NotImplemented,
                "opendpp endpoint needs DPP_OPEN firmware".to_string(),
            );
        }
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn read_raw(&mut self, timeout_ms: u32, buffer: &mut [u8]) -> Result<usize, FELibReturn> {
        self.check_open()?;
        self.require_endpoint(Endpoint::Raw)?;
        let trigger_time = self.next_trigger(timeout_ms)?;

        let mask = self.enabled_mask();
        let n_chan = mask.count_ones() as usize;
        let len = self.param_u32("/par/RecordLengthS", 1024) as usize;
        let mut waveforms = Array2::zeros((n_chan, len));
        for mut row in waveforms.rows_mut() {
            if let Some(samples) = row.as_slice_mut() {
                self.fill_waveform(samples);
            }
        }

        let mut bytes = Vec::new();
        pack_waveform_event(
            self.event_counter,
            trigger_time,
            0,
            mask,
            &waveforms,
            ByteOrder::Network,
            &mut bytes,
        );
        if bytes.len() > buffer.len() {
            return self.fail(
                FELibReturn::Generic,
                format!("Event of {} bytes does not fit read buffer", bytes.len()),
            );
        }
        self.event_counter = self.event_counter.wrapping_add(1);
        buffer[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn read_scope(&mut self, timeout_ms: u32, event: &mut ScopeEvent) -> Result<(), FELibReturn> {
        self.check_open()?;
        self.require_endpoint(Endpoint::Scope)?;
        let trigger_time = self.next_trigger(timeout_ms)?;

        let mask = self.enabled_mask();
        let len = self.param_u32("/par/RecordLengthS", 1024) as usize;
        if event.waveforms.dim() != (NUM_CHANNELS, len) {
            *event = ScopeEvent::new(NUM_CHANNELS, len);
        }
        for ch in 0..NUM_CHANNELS {
            let enabled = mask & (1 << ch) != 0;
            event.waveform_sizes[ch] = if enabled { len } else { 0 };
            if enabled {
                let mut row = event.waveforms.row_mut(ch);
                if let Some(samples) = row.as_slice_mut() {
                    self.fill_waveform(samples);
                }
            }
        }
        event.timestamp = trigger_time;
        event.event_counter = self.event_counter;
        event.flags = 0;
        self.event_counter = self.event_counter.wrapping_add(1);
        Ok(())
    }

    fn read_user(&mut self, timeout_ms: u32, event: &mut UserEvent) -> Result<(), FELibReturn> {
        self.check_open()?;
        self.require_endpoint(Endpoint::OpenDpp)?;
        let trigger_time = self.next_trigger(timeout_ms)?;

        let mask = self.enabled_mask();
        if mask == 0 {
            return Err(FELibReturn::Timeout);
        }
        // hits rotate through the enabled channels
        let ch = (0..NUM_CHANNELS)
            .map(|i| (self.user_channel + i) % NUM_CHANNELS)
            .find(|ch| mask & (1 << ch) != 0)
            .unwrap_or(0);
        self.user_channel = ch + 1;

        let quads = self.registers.get(&(0x300 + 4 * ch as u32)).copied().unwrap_or(250);
        let len = (quads as usize * 4).min(USER_WAVEFORM_MAX_SAMPLES);
        if event.waveform.len() < len {
            event.waveform.resize(len, 0);
        }
        self.fill_waveform(&mut event.waveform[..len]);
        event.channel = ch as u8;
        event.timestamp = trigger_time;
        event.waveform_size = len;
        Ok(())
    }

    fn last_error(&mut self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) -> Result<(), FELibReturn> {
        self.armed = false;
        self.running = false;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode_event;

    #[test]
    fn stuck_values_override_writes() {
        let mut config = SimConfig::default();
        config
            .stuck_values
            .insert("/par/GPIOMode".to_string(), "Busy".to_string());
        let mut sim = SimDigitizer::new("vx", config);
        sim.set_value("/par/GPIOMode", "Disabled").unwrap();
        let mut value = String::new();
        sim.get_value("/par/GPIOMode", &mut value).unwrap();
        assert_eq!(value, "Busy");
    }

    #[test]
    fn software_triggers_produce_network_order_events() {
        let mut sim = SimDigitizer::new("vx", SimConfig::default());
        sim.set_value("/par/RecordLengthS", "16").unwrap();
        for ch in 1..NUM_CHANNELS {
            sim.set_value(&format!("/ch/{ch}/par/ChEnable"), "false").unwrap();
        }
        sim.set_read_data_format(Endpoint::Raw).unwrap();
        sim.send_command("/cmd/armacquisition").unwrap();
        sim.send_command("/cmd/swstartacquisition").unwrap();
        sim.send_command("/cmd/sendswtrigger").unwrap();

        let mut buf = vec![0u8; 4096];
        let n = sim.read_raw(10, &mut buf).unwrap();
        let ev = decode_event(&buf[..n], ByteOrder::Network).unwrap();
        assert_eq!(ev.header.ch_enable_mask, 1);
        assert_eq!(ev.header.size_64bit_words, 3 + 4);
        assert_eq!(ev.channel_samples(0).len(), 16);

        assert_eq!(sim.read_raw(1, &mut buf), Err(FELibReturn::Timeout));
    }

    #[test]
    fn connector_uses_per_host_config() {
        let connector = SimConnector::new(SimConfig::default()).with_board("vx02", SimConfig::open_dpp());
        let mut t = connector.open("dig2://vx02/?monitor").unwrap();
        let mut value = String::new();
        t.get_value("/par/FwType", &mut value).unwrap();
        assert_eq!(value, "DPP_OPEN");
        assert!(connector.open("dig2://").is_err());
    }
}
