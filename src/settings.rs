//! Board and group settings.
//!
//! Every board parameter has a stable identifier ([`Param`]) with a human
//! name, used as the key in the configuration file and in readback records,
//! and a built-in default that fixes its shape. [`BoardSettings`] and
//! [`BoardReadback`] are bags of [`SettingValue`]s keyed by `Param`. Keys are
//! created up front from the defaults; looking up or assigning a key that is
//! not in the bag, or assigning a value of a different shape, is an error.

use crate::error::SettingsError;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    Str(String),
    Bool(bool),
    U16(u16),
    U32(u32),
    I32(i32),
    F64(f64),
    BoolVec(Vec<bool>),
    StrVec(Vec<String>),
    I16Vec(Vec<i16>),
    U16Vec(Vec<u16>),
    U32Vec(Vec<u32>),
    I32Vec(Vec<i32>),
    F32Vec(Vec<f32>),
}

impl SettingValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::U16(_) => "uint16",
            Self::U32(_) => "uint32",
            Self::I32(_) => "int32",
            Self::F64(_) => "double",
            Self::BoolVec(_) => "bool[]",
            Self::StrVec(_) => "string[]",
            Self::I16Vec(_) => "int16[]",
            Self::U16Vec(_) => "uint16[]",
            Self::U32Vec(_) => "uint32[]",
            Self::I32Vec(_) => "int32[]",
            Self::F32Vec(_) => "float[]",
        }
    }

    /// Number of elements; scalars count as one.
    pub fn len(&self) -> usize {
        match self {
            Self::BoolVec(v) => v.len(),
            Self::StrVec(v) => v.len(),
            Self::I16Vec(v) => v.len(),
            Self::U16Vec(v) => v.len(),
            Self::U32Vec(v) => v.len(),
            Self::I32Vec(v) => v.len(),
            Self::F32Vec(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_array(&self) -> bool {
        self.kind().ends_with("[]")
    }

    fn shape(&self) -> String {
        if self.is_array() {
            format!("{}[{}]", self.kind().trim_end_matches("[]"), self.len())
        } else {
            self.kind().to_string()
        }
    }

    pub fn same_shape(&self, other: &SettingValue) -> bool {
        self.kind() == other.kind() && self.len() == other.len()
    }
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "]")
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::BoolVec(v) => join(f, v),
            Self::StrVec(v) => join(f, v),
            Self::I16Vec(v) => join(f, v),
            Self::U16Vec(v) => join(f, v),
            Self::U32Vec(v) => join(f, v),
            Self::I32Vec(v) => join(f, v),
            Self::F32Vec(v) => join(f, v),
        }
    }
}

fn s(v: &str) -> SettingValue {
    SettingValue::Str(v.to_string())
}

fn b(v: bool) -> SettingValue {
    SettingValue::Bool(v)
}

fn u16v(v: u16) -> SettingValue {
    SettingValue::U16(v)
}

fn u32v(v: u32) -> SettingValue {
    SettingValue::U32(v)
}

macro_rules! params {
    ($($variant:ident => $name:literal = $default:expr;)*) => {
        /// Identifier of a board parameter.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Param {
            $($variant,)*
        }

        impl Param {
            pub const ALL: &'static [Param] = &[$(Param::$variant,)*];

            /// Name used in configuration files and readback records.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Param::$variant => $name,)*
                }
            }

            pub fn default_value(&self) -> SettingValue {
                match self {
                    $(Param::$variant => $default,)*
                }
            }
        }
    };
}

params! {
    Hostname => "Hostname (restart on change)" = s("");
    TriggerIdMode => "Trigger ID mode" = s("TriggerCnt");
    TriggerOutMode => "Trigger out mode" = s("TRGIN");
    GpioMode => "GPIO mode" = s("Disabled");
    SyncOutMode => "Sync out mode" = s("Disabled");
    BusyInSource => "Busy in source" = s("Disabled");
    VetoSource => "Veto source" = s("Disabled");

    Enable => "Enable" = b(true);
    ReadData => "Read data" = b(true);
    ScopeMode => "Scope mode (restart on change)" = b(true);
    UseNimIo => "Use NIM IO" = b(true);
    StartOnRunStart => "Start acq on midas run start" = b(true);
    StartOnEncodedClkin => "Start acq on encoded CLKIN" = b(false);
    StartOnSinLevel => "Start acq on SIN level" = b(false);
    StartOnSinEdge => "Start acq on SIN edge" = b(false);
    StartOnFirstTrigger => "Start acq on first trigger" = b(false);
    StartOnP0 => "Start acq on P0" = b(false);
    StartOnLvds => "Start acq on LVDS" = b(false);
    TriggerOnThreshA => "Trigger on ch over thresh A" = b(false);
    TriggerOnThreshB => "Trigger on ch over thresh B" = b(false);
    TriggerOnThreshAB => "Trigger on ch over thresh A&&B" = b(false);
    TriggerOnExternal => "Trigger on external signal" = b(true);
    TriggerOnSoftware => "Trigger on software signal" = b(true);
    TriggerOnUser => "Trigger on user mode signal" = b(false);
    TriggerOnTestPulse => "Trigger on test pulse" = b(false);
    TriggerOnLvds => "Trigger on LVDS" = b(false);
    AllowTriggerOverlap => "Allow trigger overlap" = b(false);
    EnableDcOffsets => "Enable DC offsets" = b(true);
    UseExternalClock => "Use external clock" = b(false);
    EnableClockOut => "Enable clock out" = b(false);
    VetoActiveHigh => "Veto when source is high" = b(true);
    RelativeTrigThresholds => "Use relative trig thresholds" = b(false);
    FakeSineData => "Read fake sinewave data" = b(false);
    UserExpertTrigMode => "User registers/Expert mode for trig settings" = b(false);
    UserLvdsLoopback => "User registers/Enable LVDS loopback" = b(false);
    UserOnlyReadTriggeringChannel => "User registers/Only read triggering channel" = b(true);
    UserTriggerFallingEdge => "User registers/Trigger on falling edge" = b(true);
    UserUpperMirrorsLower => "User registers/Upper 32 mirror raw of lower 32" = b(true);
    UserLvdsPair12Trigger => "User registers/Enable LVDS pair 12 trigger" = b(false);

    ReadTimeoutMs => "Read data timeout (ms)" = u32v(100);
    ReadoutMaskLow => "Readout channel mask (31-0)" = u32v(0xFFFF_FFFF);
    ReadoutMaskHigh => "Readout channel mask (63-32)" = u32v(0xFFFF_FFFF);
    WaveformLength => "Waveform length (samples)" = u32v(1000);
    TriggerDelay => "Trigger delay (samples)" = u32v(0);
    ThreshAMultiplicity => "Ch over thresh A multiplicity" = u32v(1);
    ThreshAMaskLow => "Ch over thresh A en mask(31-0)" = u32v(0xFFFF_FFFF);
    ThreshAMaskHigh => "Ch over thresh A en mask(63-32)" = u32v(0xFFFF_FFFF);
    ThreshBMultiplicity => "Ch over thresh B multiplicity" = u32v(1);
    ThreshBMaskLow => "Ch over thresh B en mask(31-0)" = u32v(0xFFFF_FFFF);
    ThreshBMaskHigh => "Ch over thresh B en mask(63-32)" = u32v(0xFFFF_FFFF);
    VetoWidth => "Veto width (ns) (0=source len)" = u32v(0);
    TestPulseWidth => "Test pulse width (ns)" = u32v(104);
    RunStartDelay => "Run start delay (cycles)" = u32v(0);
    UserDarksideMaskLow => "User registers/Darkside trigger en mask(31-0)" = u32v(0);
    UserDarksideMaskHigh => "User registers/Darkside trigger en mask(63-32)" = u32v(0);
    UserTrigThresholdLow => "User registers/Trigger on threshold (31-0)" = u32v(0);
    UserTrigThresholdHigh => "User registers/Trigger on threshold (63-32)" = u32v(0);
    UserTrigExternalLow => "User registers/Trigger on external (31-0)" = u32v(0);
    UserTrigExternalHigh => "User registers/Trigger on external (63-32)" = u32v(0);
    UserTrigInternalLow => "User registers/Trigger on internal (31-0)" = u32v(0);
    UserTrigInternalHigh => "User registers/Trigger on internal (63-32)" = u32v(0);
    UserTrigGlobalLow => "User registers/Trigger on global (31-0)" = u32v(0);
    UserTrigGlobalHigh => "User registers/Trigger on global (63-32)" = u32v(0);
    UserFirEnableLow => "User registers/Enable FIR filter (31-0)" = u32v(0);
    UserFirEnableHigh => "User registers/Enable FIR filter (63-32)" = u32v(0);
    UserWriteRawLow => "User registers/Write unfiltered data (31-0)" = u32v(0xFFFF_FFFF);
    UserWriteRawHigh => "User registers/Write unfiltered data (63-32)" = u32v(0xFFFF_FFFF);

    PreTrigger => "Pre-trigger (samples)" = u16v(100);
    LvdsIoRegister => "LVDS IO register" = u16v(0);
    TestPulseLowLevel => "Test pulse low level (ADC)" = u16v(0);
    TestPulseHighLevel => "Test pulse high level (ADC)" = u16v(1000);
    UserLvdsOutput => "User registers/LVDS output" = u16v(0);

    TestPulsePeriodMs => "Test pulse period (ms)" = SettingValue::F64(100.0);

    LvdsQuartetIsInput => "LVDS quartet is input" = SettingValue::BoolVec(vec![false; 4]);
    ChanRisingEdge => "Chan over thresh rising edge" = SettingValue::BoolVec(vec![false; 64]);
    LvdsQuartetMode => "LVDS quartet mode" = SettingValue::StrVec(vec!["SelfTriggers".to_string(); 4]);
    UserFirCoefficients => "User registers/FIR filter coefficients" = SettingValue::I16Vec(vec![1; 48]);
    UserWaveformLength => "User registers/Waveform length (samples)" = SettingValue::U16Vec(vec![1000; 64]);
    UserPreTrigger => "User registers/Pre-trigger (samples)" = SettingValue::U16Vec(vec![100; 64]);
    UserDarksideThreshold => "User registers/Darkside trigger threshold" = SettingValue::U16Vec(vec![32000; 64]);
    UserQshortLength => "User registers/Qshort length (samples)" = SettingValue::U16Vec(vec![16; 64]);
    UserQlongLength => "User registers/Qlong length (samples)" = SettingValue::U16Vec(vec![32; 64]);
    LvdsTriggerMaskLow => "LVDS trigger mask (31-0)" = SettingValue::U32Vec(vec![0xFFFF_FFFF; 16]);
    LvdsTriggerMaskHigh => "LVDS trigger mask (63-32)" = SettingValue::U32Vec(vec![0xFFFF_FFFF; 16]);
    ChanThreshWidth => "Chan over thresh width (ns)" = SettingValue::U32Vec(vec![0; 64]);
    ChanThresholds => "Chan over thresh thresholds" = SettingValue::I32Vec(vec![32768; 64]);
    DcOffsetPct => "DC offset (pct)" = SettingValue::F32Vec(vec![50.0; 64]);
    VgaGain => "VGA gain" = SettingValue::F32Vec(vec![2.5; 4]);

    FirmwareVersion => "Firmware version" = s("???");
    ModelName => "Model name" = s("???");
    UserFwRevision => "User FW revision" = u32v(0);
    UserRegRevision => "User register revision" = u32v(0);
    UpperMirrorsLower => "Upper 32 mirror raw of lower 32" = b(false);
    UserLvdsInput => "User registers/LVDS input" = u32v(0);
    UserFirGainDiscard => "User registers/FIR gain and discard" = SettingValue::U32Vec(vec![0; 64]);
    UserChannelTriggerSources => "User registers/Channel trigger sources" = SettingValue::U32Vec(vec![0; 64]);
    UserTestSignal => "User registers/Test signal" = SettingValue::U32Vec(vec![0; 64]);
}

/// Parameters that only exist in the readback.
pub const READBACK_ONLY: &[Param] = &[
    Param::FirmwareVersion,
    Param::ModelName,
    Param::UserFwRevision,
    Param::UserRegRevision,
    Param::UpperMirrorsLower,
    Param::UserLvdsInput,
    Param::UserFirGainDiscard,
    Param::UserChannelTriggerSources,
    Param::UserTestSignal,
];

impl Param {
    pub fn is_setting(&self) -> bool {
        !READBACK_ONLY.contains(self)
    }

    /// Parameters a board is configured with.
    pub fn settings() -> impl Iterator<Item = Param> {
        Self::ALL.iter().copied().filter(Param::is_setting)
    }

    pub fn from_name(name: &str) -> Option<Param> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn wrong_shape(param: Param, expected: &str, found: &SettingValue) -> SettingsError {
    SettingsError::WrongShape {
        param: param.name(),
        expected: expected.to_string(),
        found: found.shape(),
    }
}

macro_rules! scalar_getters {
    ($($fn_name:ident: $variant:ident -> $t:ty;)*) => {$(
        fn $fn_name(&self, param: Param) -> Result<$t, SettingsError> {
            match self.value(param)? {
                SettingValue::$variant(v) => Ok(*v),
                other => Err(wrong_shape(param, stringify!($t), other)),
            }
        }
    )*};
}

macro_rules! slice_getters {
    ($($fn_name:ident: $variant:ident -> $t:ty;)*) => {$(
        fn $fn_name(&self, param: Param) -> Result<&[$t], SettingsError> {
            match self.value(param)? {
                SettingValue::$variant(v) => Ok(v.as_slice()),
                other => Err(wrong_shape(param, concat!(stringify!($t), "[]"), other)),
            }
        }
    )*};
}

/// Keyed access shared by settings and readback.
pub trait ParamBag {
    fn values(&self) -> &BTreeMap<Param, SettingValue>;
    fn values_mut(&mut self) -> &mut BTreeMap<Param, SettingValue>;

    fn value(&self, param: Param) -> Result<&SettingValue, SettingsError> {
        self.values()
            .get(&param)
            .ok_or_else(|| SettingsError::UnknownParam(param.name().to_string()))
    }

    /// Replace a value. The key must exist and keep its shape.
    fn set(&mut self, param: Param, value: SettingValue) -> Result<(), SettingsError> {
        let slot = self
            .values_mut()
            .get_mut(&param)
            .ok_or_else(|| SettingsError::UnknownParam(param.name().to_string()))?;
        if !slot.same_shape(&value) {
            return Err(wrong_shape(param, &slot.shape(), &value));
        }
        *slot = value;
        Ok(())
    }

    fn get_str(&self, param: Param) -> Result<&str, SettingsError> {
        match self.value(param)? {
            SettingValue::Str(v) => Ok(v.as_str()),
            other => Err(wrong_shape(param, "string", other)),
        }
    }

    scalar_getters! {
        get_bool: Bool -> bool;
        get_u16: U16 -> u16;
        get_u32: U32 -> u32;
        get_i32: I32 -> i32;
        get_f64: F64 -> f64;
    }

    slice_getters! {
        get_bool_vec: BoolVec -> bool;
        get_str_vec: StrVec -> String;
        get_i16_vec: I16Vec -> i16;
        get_u16_vec: U16Vec -> u16;
        get_u32_vec: U32Vec -> u32;
        get_i32_vec: I32Vec -> i32;
        get_f32_vec: F32Vec -> f32;
    }

    fn set_str(&mut self, param: Param, value: &str) -> Result<(), SettingsError> {
        self.set(param, SettingValue::Str(value.to_string()))
    }

    fn set_bool(&mut self, param: Param, value: bool) -> Result<(), SettingsError> {
        self.set(param, SettingValue::Bool(value))
    }

    fn set_u16(&mut self, param: Param, value: u16) -> Result<(), SettingsError> {
        self.set(param, SettingValue::U16(value))
    }

    fn set_u32(&mut self, param: Param, value: u32) -> Result<(), SettingsError> {
        self.set(param, SettingValue::U32(value))
    }

    fn set_f64(&mut self, param: Param, value: f64) -> Result<(), SettingsError> {
        self.set(param, SettingValue::F64(value))
    }
}

/// Desired configuration of one board.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardSettings {
    values: BTreeMap<Param, SettingValue>,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            values: Param::settings().map(|p| (p, p.default_value())).collect(),
        }
    }
}

impl ParamBag for BoardSettings {
    fn values(&self) -> &BTreeMap<Param, SettingValue> {
        &self.values
    }

    fn values_mut(&mut self) -> &mut BTreeMap<Param, SettingValue> {
        &mut self.values
    }
}

impl BoardSettings {
    pub fn hostname(&self) -> Result<&str, SettingsError> {
        self.get_str(Param::Hostname)
    }

    pub fn is_enabled(&self) -> Result<bool, SettingsError> {
        self.get_bool(Param::Enable)
    }

    pub fn read_data(&self) -> Result<bool, SettingsError> {
        self.get_bool(Param::ReadData)
    }

    pub fn is_scope_mode(&self) -> Result<bool, SettingsError> {
        self.get_bool(Param::ScopeMode)
    }

    pub fn read_timeout_ms(&self) -> Result<u32, SettingsError> {
        self.get_u32(Param::ReadTimeoutMs)
    }

    /// Combine a low/high pair of 32-bit mask settings.
    pub fn mask64(&self, low: Param, high: Param) -> Result<u64, SettingsError> {
        Ok(u64::from(self.get_u32(low)?) | (u64::from(self.get_u32(high)?) << 32))
    }
}

/// What was read back from one board: every setting plus identity and
/// firmware details.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardReadback {
    values: BTreeMap<Param, SettingValue>,
}

impl Default for BoardReadback {
    fn default() -> Self {
        Self {
            values: Param::ALL.iter().map(|p| (*p, p.default_value())).collect(),
        }
    }
}

impl ParamBag for BoardReadback {
    fn values(&self) -> &BTreeMap<Param, SettingValue> {
        &self.values
    }

    fn values_mut(&mut self) -> &mut BTreeMap<Param, SettingValue> {
        &mut self.values
    }
}

impl BoardReadback {
    pub fn set_firmware_info(&mut self, version: &str, model: &str) -> Result<(), SettingsError> {
        self.set_str(Param::FirmwareVersion, version)?;
        self.set_str(Param::ModelName, model)
    }

    pub fn set_user_firmware_info(
        &mut self,
        fw_revision: u32,
        reg_revision: u32,
        upper_mirrors_lower: bool,
    ) -> Result<(), SettingsError> {
        self.set_u32(Param::UserFwRevision, fw_revision)?;
        self.set_u32(Param::UserRegRevision, reg_revision)?;
        self.set_bool(Param::UpperMirrorsLower, upper_mirrors_lower)
    }

    pub fn set_lvds_readback(
        &mut self,
        io_register: u16,
        user_output: u16,
        user_input: u32,
    ) -> Result<(), SettingsError> {
        self.set_u16(Param::LvdsIoRegister, io_register)?;
        self.set_u16(Param::UserLvdsOutput, user_output)?;
        self.set_u32(Param::UserLvdsInput, user_input)
    }

    pub fn model_name(&self) -> Result<&str, SettingsError> {
        self.get_str(Param::ModelName)
    }
}

/// Settings shared by every board of a front-end group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSettings {
    pub num_boards: usize,
    pub merge_data_using_event_id: bool,
    pub debug_data: bool,
    pub debug_rates: bool,
    pub debug_settings: bool,
    pub debug_ring_buffers: bool,
    pub multithreaded_readout: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            num_boards: 1,
            merge_data_using_event_id: false,
            debug_data: false,
            debug_rates: false,
            debug_settings: false,
            debug_ring_buffers: false,
            multithreaded_readout: true,
        }
    }
}

/// Latest error flags of a board and their description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoardErrors {
    pub bitmask: u32,
    pub message: String,
}

impl BoardErrors {
    pub fn from_bitmask(bitmask: u32) -> Self {
        Self {
            bitmask,
            message: crate::params::error_to_text(bitmask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = Param::ALL.iter().map(Param::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Param::ALL.len());
    }

    #[test]
    fn readback_covers_every_setting() {
        let set = BoardSettings::default();
        let rdb = BoardReadback::default();
        for (param, value) in set.values() {
            let read = rdb.value(*param).unwrap();
            assert!(read.same_shape(value), "{param}");
        }
        assert!(set.value(Param::FirmwareVersion).is_err());
        assert_eq!(rdb.get_str(Param::ModelName).unwrap(), "???");
    }

    #[test]
    fn defaults() {
        let set = BoardSettings::default();
        assert_eq!(set.get_u32(Param::WaveformLength).unwrap(), 1000);
        assert_eq!(set.get_u16(Param::PreTrigger).unwrap(), 100);
        assert_eq!(set.get_f64(Param::TestPulsePeriodMs).unwrap(), 100.0);
        assert_eq!(set.get_i16_vec(Param::UserFirCoefficients).unwrap(), &[1; 48][..]);
        assert_eq!(set.get_f32_vec(Param::VgaGain).unwrap(), &[2.5; 4][..]);
        assert_eq!(
            set.mask64(Param::ReadoutMaskLow, Param::ReadoutMaskHigh).unwrap(),
            u64::MAX
        );
        assert!(set.is_scope_mode().unwrap());
        assert_eq!(GroupSettings::default().num_boards, 1);
    }

    #[test]
    fn lookups_fail_loudly() {
        let mut set = BoardSettings::default();
        assert!(matches!(
            set.get_u32(Param::PreTrigger),
            Err(SettingsError::WrongShape { param: "Pre-trigger (samples)", .. })
        ));
        assert!(matches!(
            set.set_u32(Param::UserFwRevision, 1),
            Err(SettingsError::UnknownParam(_))
        ));
        assert!(set
            .set(Param::VgaGain, SettingValue::F32Vec(vec![1.0; 3]))
            .is_err());
        set.set(Param::VgaGain, SettingValue::F32Vec(vec![1.0; 4]))
            .unwrap();
    }

    #[test]
    fn names_resolve() {
        assert_eq!(Param::from_name("VGA gain"), Some(Param::VgaGain));
        assert_eq!(Param::from_name("No such thing"), None);
        assert!(!Param::UserTestSignal.is_setting());
    }

    #[test]
    fn errors_describe_bits() {
        let err = BoardErrors::from_bitmask(1 << 1);
        assert_eq!(err.message, "Initialization fail. ");
    }
}
