//! Typed access to board parameters and user registers.
//!
//! Values cross the transport as strings. [`ParamValue`] does the
//! marshalling: booleans are `true`/`false` (read case-insensitively),
//! integers are parsed at full width and then narrowed, failing instead of
//! truncating when the board returns something that does not fit.
//! Multi-valued parameters (start and trigger sources) are `|`-joined tokens.

use crate::dig2::Dig2;
use crate::error::DeviceError;
use log::error;
use std::fmt;

pub const NUM_LVDS_QUARTETS: usize = 4;
pub const NUM_LVDS_LINES: usize = 16;
pub const NUM_VGA_GROUPS: usize = 4;

/// Firmware flavour reported by `FwType`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirmwareType {
    Scope,
    DppOpen,
    Other(String),
}

impl FirmwareType {
    pub fn parse(fw_type: &str) -> Self {
        match fw_type {
            "Scope" => Self::Scope,
            "DPP_OPEN" => Self::DppOpen,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Scope => "Scope",
            Self::DppOpen => "DPP_OPEN",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn get_error(path: &str, message: &str) -> DeviceError {
    DeviceError::Get {
        path: path.to_string(),
        message: message.to_string(),
    }
}

/// A value that can be written to and read back from a parameter path.
pub trait ParamValue: Sized {
    fn to_param(&self) -> String;
    fn from_param(path: &str, raw: &str) -> Result<Self, DeviceError>;
}

impl ParamValue for String {
    fn to_param(&self) -> String {
        self.clone()
    }

    fn from_param(_path: &str, raw: &str) -> Result<Self, DeviceError> {
        Ok(raw.to_string())
    }
}

impl ParamValue for bool {
    fn to_param(&self) -> String {
        String::from(if *self { "true" } else { "false" })
    }

    fn from_param(path: &str, raw: &str) -> Result<Self, DeviceError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(get_error(path, "Read unexpected value for boolean"))
        }
    }
}

macro_rules! unsigned_param {
    ($($t:ty),*) => {$(
        impl ParamValue for $t {
            fn to_param(&self) -> String {
                self.to_string()
            }

            fn from_param(path: &str, raw: &str) -> Result<Self, DeviceError> {
                let full: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| get_error(path, "Failed to parse value as an unsigned integer"))?;
                <$t>::try_from(full).map_err(|_| {
                    get_error(path, &format!("Read unexpectedly large value (>{}bit)", <$t>::BITS))
                })
            }
        }
    )*};
}

macro_rules! signed_param {
    ($($t:ty),*) => {$(
        impl ParamValue for $t {
            fn to_param(&self) -> String {
                self.to_string()
            }

            fn from_param(path: &str, raw: &str) -> Result<Self, DeviceError> {
                let full: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| get_error(path, "Failed to parse value as a signed integer"))?;
                <$t>::try_from(full).map_err(|_| {
                    get_error(path, &format!("Read unexpectedly large value (>{}bit)", <$t>::BITS))
                })
            }
        }
    )*};
}

macro_rules! float_param {
    ($($t:ty),*) => {$(
        impl ParamValue for $t {
            fn to_param(&self) -> String {
                format!("{:.6}", self)
            }

            fn from_param(path: &str, raw: &str) -> Result<Self, DeviceError> {
                raw.trim()
                    .parse()
                    .map_err(|_| get_error(path, "Failed to parse value as a float"))
            }
        }
    )*};
}

unsigned_param!(u8, u16, u32, u64);
signed_param!(i16, i32, i64);
float_param!(f32, f64);

pub fn dig_path(name: &str) -> String {
    format!("/par/{name}")
}

pub fn chan_path(channel: usize, name: &str) -> String {
    format!("/ch/{channel}/par/{name}")
}

pub fn lvds_path(quartet: usize, name: &str) -> String {
    format!("/lvds/{quartet}/par/{name}")
}

pub fn vga_path(group: usize, name: &str) -> String {
    format!("/vga/{group}/par/{name}")
}

pub fn merge_string_options(opts: &[&str]) -> String {
    opts.join("|")
}

pub fn split_string_options(opts: &str) -> Vec<&str> {
    opts.split('|').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Bit number and description of every flag in `ErrorFlags`.
pub const ERROR_BITS: [(u32, &str); 17] = [
    (0, "Power supply fail"),
    (1, "Initialization fail"),
    (2, "SI5341 PLL unlocked"),
    (3, "SI5395 PLL unlocked"),
    (4, "LMK04832 PLL unlocked"),
    (5, "JESD204B bus unlocked"),
    (6, "FPGA DDR4 Bank0 calibration fail"),
    (7, "FPGA DDR4 Bank1 calibration fail"),
    (8, "Processor DDR4 calibration fail"),
    (9, "FPGA calibration fail"),
    (10, "Board ID Card check fail"),
    (11, "ADC temperature out of range"),
    (12, "Air outlet temperature out of range"),
    (13, "FPGA temperature out of range"),
    (14, "FPGA power supply temperature out of range"),
    (15, "Clock fail"),
    (16, "ADC shutdown due to overheating"),
];

pub fn error_to_text(mask: u32) -> String {
    ERROR_BITS
        .iter()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, text)| format!("{text}. "))
        .collect()
}

/// Conditions that start acquisition once the board is armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartSources {
    pub software: bool,
    pub encoded_clkin: bool,
    pub sin_level: bool,
    pub sin_edge: bool,
    pub lvds: bool,
    pub first_trigger: bool,
    pub p0: bool,
}

impl StartSources {
    fn tokens(&self) -> Vec<&'static str> {
        [
            (self.software, "SWcmd"),
            (self.encoded_clkin, "EncodedClkIn"),
            (self.sin_level, "SINlevel"),
            (self.sin_edge, "SINedge"),
            (self.lvds, "LVDS"),
            (self.first_trigger, "FirstTrigger"),
            (self.p0, "P0"),
        ]
        .into_iter()
        .filter_map(|(on, token)| on.then_some(token))
        .collect()
    }

    fn parse(merged: &str) -> Self {
        Self {
            software: merged.contains("SWcmd"),
            encoded_clkin: merged.contains("EncodedClkIn"),
            sin_level: merged.contains("SINlevel"),
            sin_edge: merged.contains("SINedge"),
            lvds: merged.contains("LVDS"),
            first_trigger: merged.contains("FirstTrigger"),
            p0: merged.contains("P0"),
        }
    }
}

/// Signals that generate an acquisition trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerSources {
    pub over_thresh_a: bool,
    pub over_thresh_b: bool,
    pub over_thresh_a_and_b: bool,
    pub external: bool,
    pub software: bool,
    pub user: bool,
    pub test_pulse: bool,
    pub lvds: bool,
}

impl TriggerSources {
    fn tokens(&self) -> Vec<&'static str> {
        [
            (self.over_thresh_a, "ITLA"),
            (self.over_thresh_b, "ITLB"),
            (self.over_thresh_a_and_b, "ITLA_AND_ITLB"),
            (self.external, "TrgIn"),
            (self.software, "SwTrg"),
            (self.test_pulse, "TestPulse"),
            (self.lvds, "LVDS"),
            (self.user, "UserTrg"),
        ]
        .into_iter()
        .filter_map(|(on, token)| on.then_some(token))
        .collect()
    }

    fn parse(path: &str, merged: &str) -> Result<Self, DeviceError> {
        let mut sources = Self::default();
        for token in split_string_options(merged) {
            match token {
                "ITLA" => sources.over_thresh_a = true,
                "ITLB" => sources.over_thresh_b = true,
                "ITLA_AND_ITLB" => sources.over_thresh_a_and_b = true,
                "TrgIn" => sources.external = true,
                "SwTrg" => sources.software = true,
                "UserTrg" => sources.user = true,
                "LVDS" => sources.lvds = true,
                "TestPulse" => sources.test_pulse = true,
                _ => return Err(get_error(path, "Read unexpected trigger source")),
            }
        }
        Ok(sources)
    }
}

/// The two channel-over-threshold trigger logic blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItlGroup {
    A,
    B,
}

impl ItlGroup {
    fn prefix(&self) -> &'static str {
        match self {
            Self::A => "ITLA",
            Self::B => "ITLB",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelThreshold {
    pub relative: bool,
    pub threshold: i32,
    pub rising_edge: bool,
    pub width_ns: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VetoParams {
    pub source: String,
    pub active_high: bool,
    pub width_ns: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestPulse {
    pub period_ms: f64,
    pub width_ns: u32,
    pub low_level_adc: u16,
    pub high_level_adc: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Temperatures {
    pub air_in: f32,
    pub air_out: f32,
    pub hottest_adc: f32,
}

impl Dig2 {
    pub fn get<T: ParamValue>(&mut self, path: &str) -> Result<T, DeviceError> {
        let raw = self.getvalue(path)?;
        T::from_param(path, &raw)
    }

    /// Get a parameter whose value buffer carries an argument.
    pub fn get_with_arg<T: ParamValue>(&mut self, path: &str, arg: &str) -> Result<T, DeviceError> {
        let raw = self.getvalue_with_arg(path, arg)?;
        T::from_param(path, &raw)
    }

    pub fn set<T: ParamValue>(&mut self, path: &str, value: T) -> Result<(), DeviceError> {
        self.setvalue(path, &value.to_param())
    }

    pub fn get_dig<T: ParamValue>(&mut self, name: &str) -> Result<T, DeviceError> {
        self.get(&dig_path(name))
    }

    pub fn set_dig<T: ParamValue>(&mut self, name: &str, value: T) -> Result<(), DeviceError> {
        self.set(&dig_path(name), value)
    }

    pub fn get_chan<T: ParamValue>(&mut self, channel: usize, name: &str) -> Result<T, DeviceError> {
        self.get(&chan_path(channel, name))
    }

    pub fn set_chan<T: ParamValue>(
        &mut self,
        channel: usize,
        name: &str,
        value: T,
    ) -> Result<(), DeviceError> {
        self.set(&chan_path(channel, name), value)
    }

    pub fn get_user_register_u16(&mut self, address: u32) -> Result<u16, DeviceError> {
        let full = self.get_user_register(address)?;
        u16::try_from(full).map_err(|_| {
            get_error(
                &format!("User register 0x{address:x}"),
                "Read unexpectedly large value (>16bit)",
            )
        })
    }

    /// Coefficient registers hold a sign-extended 16-bit value; keep the
    /// low half.
    pub fn get_user_register_i16(&mut self, address: u32) -> Result<i16, DeviceError> {
        Ok(self.get_user_register(address)? as i16)
    }

    /// Write `value` after checking it against the parameter's allowed
    /// values (compared case-insensitively).
    pub fn set_validated(&mut self, path: &str, value: &str) -> Result<(), DeviceError> {
        let allowed = self.get_allowed_values(path)?;
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
            error!(
                "Unexpected value for {path}: {value}. Not one of: {}",
                allowed.join(", ")
            );
            return Err(DeviceError::NotAllowed {
                path: path.to_string(),
                value: value.to_string(),
                allowed,
            });
        }
        self.setvalue(path, value)
    }

    pub fn get_firmware_type(&mut self) -> Result<FirmwareType, DeviceError> {
        let fw_type: String = self.get_dig("FwType")?;
        Ok(FirmwareType::parse(&fw_type))
    }

    pub fn get_firmware_version(&mut self) -> Result<String, DeviceError> {
        self.get_dig("cupver")
    }

    pub fn get_model_name(&mut self) -> Result<String, DeviceError> {
        self.get_dig("ModelName")
    }

    pub fn set_start_sources(&mut self, sources: &StartSources) -> Result<(), DeviceError> {
        self.setvalue(
            &dig_path("StartSource"),
            &merge_string_options(&sources.tokens()),
        )
    }

    pub fn get_start_sources(&mut self) -> Result<StartSources, DeviceError> {
        let merged: String = self.get_dig("StartSource")?;
        Ok(StartSources::parse(&merged))
    }

    pub fn is_sw_start_enabled(&mut self) -> Result<bool, DeviceError> {
        Ok(self.get_start_sources()?.software)
    }

    pub fn set_trigger_sources(&mut self, sources: &TriggerSources) -> Result<(), DeviceError> {
        self.setvalue(
            &dig_path("AcqTriggerSource"),
            &merge_string_options(&sources.tokens()),
        )
    }

    pub fn get_trigger_sources(&mut self) -> Result<TriggerSources, DeviceError> {
        let path = dig_path("AcqTriggerSource");
        let merged: String = self.get(&path)?;
        TriggerSources::parse(&path, &merged)
    }

    /// Enable channels by bit; bit i is channel i.
    pub fn set_channel_enable_mask(&mut self, mask: u64) -> Result<(), DeviceError> {
        for ch in 0..64 {
            self.set_chan(ch, "ChEnable", mask & (1 << ch) != 0)?;
        }
        Ok(())
    }

    pub fn get_channel_enable_mask(&mut self) -> Result<u64, DeviceError> {
        let mut mask = 0u64;
        for ch in 0..64 {
            if self.get_chan::<bool>(ch, "ChEnable")? {
                mask |= 1 << ch;
            }
        }
        Ok(mask)
    }

    /// OR logic for a multiplicity of at most one, majority otherwise.
    pub fn set_over_threshold_trigger(
        &mut self,
        group: ItlGroup,
        multiplicity: u32,
        mask: u64,
    ) -> Result<(), DeviceError> {
        let prefix = group.prefix();
        let main_logic = if multiplicity <= 1 { "OR" } else { "Majority" };
        self.setvalue(&dig_path(&format!("{prefix}MainLogic")), main_logic)?;
        self.setvalue(&dig_path(&format!("{prefix}PairLogic")), "NONE")?;
        self.set_dig(&format!("{prefix}MajorityLev"), multiplicity)?;
        self.set_dig(&format!("{prefix}Mask"), mask)
    }

    /// Returns the multiplicity and the 64-bit mask.
    pub fn get_over_threshold_trigger(&mut self, group: ItlGroup) -> Result<(u32, u64), DeviceError> {
        let prefix = group.prefix();
        let multiplicity = self.get_dig(&format!("{prefix}MajorityLev"))?;
        let mask = self.get_dig(&format!("{prefix}Mask"))?;
        Ok((multiplicity, mask))
    }

    pub fn set_nim_ttl(&mut self, is_nim: bool) -> Result<(), DeviceError> {
        self.setvalue(&dig_path("IOlevel"), if is_nim { "NIM" } else { "TTL" })
    }

    pub fn get_nim_ttl(&mut self) -> Result<bool, DeviceError> {
        let path = dig_path("IOlevel");
        let level: String = self.get(&path)?;
        if level.eq_ignore_ascii_case("nim") {
            Ok(true)
        } else if level.eq_ignore_ascii_case("ttl") {
            Ok(false)
        } else {
            Err(get_error(&path, "Read unexpected value (not nim/ttl)"))
        }
    }

    pub fn set_trigout_mode(&mut self, mode: &str) -> Result<(), DeviceError> {
        self.set_validated(&dig_path("TrgOutMode"), mode)
    }

    pub fn get_trigout_mode(&mut self) -> Result<String, DeviceError> {
        self.get_dig("TrgOutMode")
    }

    pub fn set_trigger_id_mode(&mut self, mode: &str) -> Result<(), DeviceError> {
        self.set_validated(&dig_path("TriggerIDMode"), mode)
    }

    pub fn get_trigger_id_mode(&mut self) -> Result<String, DeviceError> {
        self.get_dig("TriggerIDMode")
    }

    pub fn set_use_external_clock(&mut self, external: bool) -> Result<(), DeviceError> {
        self.setvalue(
            &dig_path("ClockSource"),
            if external { "FPClkIn" } else { "Internal" },
        )
    }

    pub fn get_use_external_clock(&mut self) -> Result<bool, DeviceError> {
        let source: String = self.get_dig("ClockSource")?;
        Ok(source.eq_ignore_ascii_case("fpclkin"))
    }

    /// Fake sine data goes to every channel.
    pub fn set_enable_fake_sine_data(&mut self, enable: bool) -> Result<(), DeviceError> {
        let source = if enable { "ADC_TEST_SIN" } else { "ADC_DATA" };
        for ch in 0..64 {
            self.setvalue(&chan_path(ch, "WaveDataSource"), source)?;
        }
        Ok(())
    }

    /// Fails if the channels disagree.
    pub fn get_enable_fake_sine_data(&mut self) -> Result<bool, DeviceError> {
        let mut enable = false;
        for ch in 0..64 {
            let source: String = self.get_chan(ch, "WaveDataSource")?;
            let this_enable = source.eq_ignore_ascii_case("adc_test_sin");
            if ch > 0 && this_enable != enable {
                return Err(get_error(
                    "WaveDataSource",
                    &format!("Mismatched WaveDataSource for channel {ch}"),
                ));
            }
            enable = this_enable;
        }
        Ok(enable)
    }

    pub fn set_veto_params(&mut self, veto: &VetoParams) -> Result<(), DeviceError> {
        self.setvalue(&dig_path("VetoSource"), &veto.source)?;
        self.set_dig("VetoWidth", veto.width_ns)?;
        self.setvalue(
            &dig_path("VetoPolarity"),
            if veto.active_high { "ActiveHigh" } else { "ActiveLow" },
        )
    }

    pub fn get_veto_params(&mut self) -> Result<VetoParams, DeviceError> {
        let source = self.get_dig("VetoSource")?;
        let width_ns = self.get_dig("VetoWidth")?;
        let polarity: String = self.get_dig("VetoPolarity")?;
        Ok(VetoParams {
            source,
            active_high: polarity.eq_ignore_ascii_case("activehigh"),
            width_ns,
        })
    }

    /// The board takes the period in ns.
    pub fn set_test_pulse(&mut self, pulse: &TestPulse) -> Result<(), DeviceError> {
        self.set_dig("TestPulsePeriod", pulse.period_ms * 1e6)?;
        self.set_dig("TestPulseWidth", pulse.width_ns)?;
        self.set_dig("TestPulseLowLevel", pulse.low_level_adc)?;
        self.set_dig("TestPulseHighLevel", pulse.high_level_adc)
    }

    pub fn get_test_pulse(&mut self) -> Result<TestPulse, DeviceError> {
        let period_ns: u32 = self.get_dig("TestPulsePeriod")?;
        Ok(TestPulse {
            period_ms: f64::from(period_ns) / 1e6,
            width_ns: self.get_dig("TestPulseWidth")?,
            low_level_adc: self.get_dig("TestPulseLowLevel")?,
            high_level_adc: self.get_dig("TestPulseHighLevel")?,
        })
    }

    pub fn set_channel_trigger_threshold(
        &mut self,
        channel: usize,
        thr: &ChannelThreshold,
    ) -> Result<(), DeviceError> {
        self.setvalue(
            &chan_path(channel, "TriggerThrMode"),
            if thr.relative { "Relative" } else { "Absolute" },
        )?;
        self.set_chan(channel, "TriggerThr", thr.threshold)?;
        self.setvalue(
            &chan_path(channel, "SelfTriggerEdge"),
            if thr.rising_edge { "RISE" } else { "FALL" },
        )?;
        self.set_chan(channel, "SelfTriggerWidth", thr.width_ns)
    }

    pub fn get_channel_trigger_threshold(&mut self, channel: usize) -> Result<ChannelThreshold, DeviceError> {
        let threshold = self.get_chan(channel, "TriggerThr")?;
        let width_ns = self.get_chan(channel, "SelfTriggerWidth")?;

        let mode_path = chan_path(channel, "TriggerThrMode");
        let relative = match self.get::<String>(&mode_path)?.as_str() {
            "Relative" => true,
            "Absolute" => false,
            _ => {
                return Err(get_error(
                    &mode_path,
                    "Read unexpected value (expect Relative/Absolute)",
                ))
            }
        };

        let edge_path = chan_path(channel, "SelfTriggerEdge");
        let rising_edge = match self.get::<String>(&edge_path)?.as_str() {
            "RISE" => true,
            "FALL" => false,
            _ => return Err(get_error(&edge_path, "Read unexpected value (expect RISE/FALL)")),
        };

        Ok(ChannelThreshold {
            relative,
            threshold,
            rising_edge,
            width_ns,
        })
    }

    pub fn set_lvds_quartet(&mut self, quartet: usize, is_input: bool, mode: &str) -> Result<(), DeviceError> {
        self.setvalue(
            &lvds_path(quartet, "LVDSDirection"),
            if is_input { "Input" } else { "Output" },
        )?;
        self.setvalue(&lvds_path(quartet, "LVDSMode"), mode)
    }

    /// Returns whether the quartet is an input, and its mode.
    pub fn get_lvds_quartet(&mut self, quartet: usize) -> Result<(bool, String), DeviceError> {
        let direction: String = self.get(&lvds_path(quartet, "LVDSDirection"))?;
        let mode = self.get(&lvds_path(quartet, "LVDSMode"))?;
        Ok((direction.eq_ignore_ascii_case("input"), mode))
    }

    /// `LVDSTrgMask` is written as `<line>=<mask>` and read with the line
    /// number in the value buffer.
    pub fn set_lvds_trigger_mask(&mut self, line: usize, mask: u64) -> Result<(), DeviceError> {
        self.setvalue(&dig_path("LVDSTrgMask"), &format!("{line}={mask}"))
    }

    pub fn get_lvds_trigger_mask(&mut self, line: usize) -> Result<u64, DeviceError> {
        self.get_with_arg(&dig_path("LVDSTrgMask"), &line.to_string())
    }

    pub fn set_vga_gain(&mut self, group: usize, gain: f32) -> Result<(), DeviceError> {
        self.set(&vga_path(group, "VGAGain"), gain)
    }

    pub fn get_vga_gain(&mut self, group: usize) -> Result<f32, DeviceError> {
        self.get(&vga_path(group, "VGAGain"))
    }

    pub fn get_acquisition_status(&mut self) -> Result<u32, DeviceError> {
        self.get_dig("AcquisitionStatus")
    }

    pub fn get_temperatures(&mut self) -> Result<Temperatures, DeviceError> {
        Ok(Temperatures {
            air_in: self.get_dig("TempSensAirIn")?,
            air_out: self.get_dig("TempSensAirOut")?,
            hottest_adc: self.get_dig("TempSensHottestADC")?,
        })
    }

    pub fn get_max_raw_bytes_per_read(&mut self) -> Result<u32, DeviceError> {
        self.get_dig("MaxRawDataSize")
    }

    pub fn get_error_flags(&mut self) -> Result<u32, DeviceError> {
        self.get_dig("ErrorFlags")
    }
}
