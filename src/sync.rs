//! Writing settings to a board and checking them by readback.
//!
//! Every parameter group is written, read straight back into the board's
//! [`BoardReadback`], and compared with what was requested. The first
//! disagreement stops configuration of that board with
//! [`SettingsError::ConfigMismatch`].

use crate::dig2::Dig2;
use crate::error::SettingsError;
use crate::params::{
    ChannelThreshold, ItlGroup, StartSources, TestPulse, TriggerSources, VetoParams,
    NUM_LVDS_LINES, NUM_LVDS_QUARTETS, NUM_VGA_GROUPS,
};
use crate::settings::{
    BoardErrors, BoardReadback, BoardSettings, GroupSettings, Param, ParamBag, SettingValue,
};
use crate::store::SettingsStore;
use crate::utils::lock;
use log::{debug, error, info};
use std::fmt::Display;
use std::sync::{Arc, Mutex};

const NUM_CHANNELS: usize = 64;
const MAX_USER_PRE_TRIGGER: u16 = 0xFFF;

/// Equality used when checking a readback.
pub trait Compare: Display {
    fn same(&self, other: &Self) -> bool;
}

macro_rules! exact_compare {
    ($($t:ty),*) => {$(
        impl Compare for $t {
            fn same(&self, other: &Self) -> bool {
                self == other
            }
        }
    )*};
}

exact_compare!(bool, u16, u32, u64, i16, i32);

impl Compare for f32 {
    fn same(&self, other: &Self) -> bool {
        (self - other).abs() < 0.001
    }
}

impl Compare for f64 {
    fn same(&self, other: &Self) -> bool {
        (self - other).abs() < 0.001
    }
}

impl Compare for str {
    fn same(&self, other: &Self) -> bool {
        self.eq_ignore_ascii_case(other)
    }
}

impl Compare for String {
    fn same(&self, other: &Self) -> bool {
        self.eq_ignore_ascii_case(other)
    }
}

pub fn validate<T: Compare + ?Sized>(
    set: &T,
    read: &T,
    param: &str,
    board: &str,
) -> Result<(), SettingsError> {
    if set.same(read) {
        return Ok(());
    }
    let err = SettingsError::ConfigMismatch {
        param: param.to_string(),
        board: board.to_string(),
        set: set.to_string(),
        read: read.to_string(),
    };
    error!("{err}");
    Err(err)
}

/// Gain and number of upper bits to discard so that the FIR output keeps
/// the amplitude of its input.
///
/// The filter multiplies the weighted sum by `gain`, drops the top
/// `discard` bits of the 56-bit product and keeps the next 16, which is a
/// multiplication by `gain / 2^(56 - discard - 16)`. The smallest discard
/// whose gain fits in 15 bits wins.
pub fn compute_fir_gain_and_discard(coeffs: &[i16]) -> Result<(u16, u16), SettingsError> {
    const MIN_DISCARD: u32 = 2;
    const MAX_DISCARD: u32 = 64 - 16;

    let coeff_sum: i32 = coeffs.iter().map(|&c| i32::from(c)).sum();
    let coeff_sum_abs = u64::from(coeff_sum.unsigned_abs());

    if coeff_sum_abs == 0 {
        return Err(SettingsError::Computation(
            "sum of all coefficients must not equal 0!".to_string(),
        ));
    }

    for discard in MIN_DISCARD..=MAX_DISCARD {
        let shift = 56u32.saturating_sub(discard + 16);
        let gain_full = (1u64 << shift) / coeff_sum_abs;

        if gain_full < 0x8000 {
            // both fit: gain < 0x8000, discard <= 48
            return Ok((gain_full as u16, discard as u16));
        }
    }

    Err(SettingsError::Computation(
        "no suitable gain/discard settings will result in the output being at the same level as the input"
            .to_string(),
    ))
}

/// Write every parameter group of `set` to `dev`, filling `rdb` with what
/// the board reports.
pub fn write_and_validate(
    dev: &mut Dig2,
    set: &BoardSettings,
    rdb: &mut BoardReadback,
    debug_settings: bool,
) -> Result<(), SettingsError> {
    let scope_mode = set.is_scope_mode()?;

    // Derived user-register values must be valid before anything is written.
    let fir = if scope_mode {
        None
    } else {
        let coeffs = set.get_i16_vec(Param::UserFirCoefficients)?;
        let (gain, discard) = compute_fir_gain_and_discard(coeffs)?;
        if debug_settings {
            let sum = coeffs.iter().map(|&c| i32::from(c)).sum::<i32>().unsigned_abs();
            let ideal = 1.0 / f64::from(sum);
            let ours = f64::from(gain) / (1u64 << (56 - 16 - u32::from(discard))) as f64;
            debug!(
                "Ideal FIR factor is {ideal:.10}; approximation is {ours:.10} (gain {gain}, discard top {discard} bits)"
            );
        }
        if let Some(pre) = set
            .get_u16_vec(Param::UserPreTrigger)?
            .iter()
            .find(|&&pre| pre > MAX_USER_PRE_TRIGGER)
        {
            return Err(SettingsError::InvalidValue {
                param: Param::UserPreTrigger.name().to_string(),
                message: format!("Max user-mode pre-trigger length is 0xFFF samples, got {pre}."),
            });
        }
        Some((gain, discard))
    };

    dev.set_debug(debug_settings);
    if debug_settings {
        info!("Setting parameters for {}", dev.name());
    }

    let mut sync = BoardSync {
        board: dev.name().to_string(),
        dev,
        set,
        rdb,
    };

    sync.start_sources()?;
    sync.trigger_sources(scope_mode)?;
    sync.readout_mask()?;
    sync.over_threshold()?;
    sync.front_panel()?;
    sync.dc_offsets()?;
    sync.busy_veto()?;
    sync.lvds()?;
    sync.test_pulse()?;

    match fir {
        None => {
            sync.scope_readout()?;
            sync.scope_trigger()?;
        }
        Some((gain, discard)) => sync.user_registers(gain, discard)?,
    }

    if sync.rdb.model_name()? == "VX2745" {
        sync.vga_gain()?;
    }

    if debug_settings {
        info!("Finished setting parameters for board {}", sync.board);
    }
    Ok(())
}

struct BoardSync<'a> {
    board: String,
    dev: &'a mut Dig2,
    set: &'a BoardSettings,
    rdb: &'a mut BoardReadback,
}

impl BoardSync<'_> {
    fn check<T: Compare + ?Sized>(&self, param: &str, set: &T, read: &T) -> Result<(), SettingsError> {
        validate(set, read, param, &self.board)
    }

    fn check_element<T: Compare>(&self, param: Param, idx: usize, set: &T, read: &T) -> Result<(), SettingsError> {
        validate(set, read, &format!("{}[{idx}]", param.name()), &self.board)
    }

    fn read_bool(&mut self, param: Param, read: bool) -> Result<(), SettingsError> {
        self.rdb.set_bool(param, read)?;
        self.check(param.name(), &self.set.get_bool(param)?, &read)
    }

    fn read_u16(&mut self, param: Param, read: u16) -> Result<(), SettingsError> {
        self.rdb.set_u16(param, read)?;
        self.check(param.name(), &self.set.get_u16(param)?, &read)
    }

    fn read_u32(&mut self, param: Param, read: u32) -> Result<(), SettingsError> {
        self.rdb.set_u32(param, read)?;
        self.check(param.name(), &self.set.get_u32(param)?, &read)
    }

    fn read_str(&mut self, param: Param, read: &str) -> Result<(), SettingsError> {
        self.rdb.set_str(param, read)?;
        self.check(param.name(), self.set.get_str(param)?, read)
    }

    fn dig_bool(&mut self, param: Param, name: &str) -> Result<(), SettingsError> {
        self.dev.set_dig(name, self.set.get_bool(param)?)?;
        let read = self.dev.get_dig(name)?;
        self.read_bool(param, read)
    }

    fn dig_u16(&mut self, param: Param, name: &str) -> Result<(), SettingsError> {
        self.dev.set_dig(name, self.set.get_u16(param)?)?;
        let read = self.dev.get_dig(name)?;
        self.read_u16(param, read)
    }

    fn dig_u32(&mut self, param: Param, name: &str) -> Result<(), SettingsError> {
        self.dev.set_dig(name, self.set.get_u32(param)?)?;
        let read = self.dev.get_dig(name)?;
        self.read_u32(param, read)
    }

    fn dig_str(&mut self, param: Param, name: &str) -> Result<(), SettingsError> {
        self.dev.set_dig(name, self.set.get_str(param)?.to_string())?;
        let read: String = self.dev.get_dig(name)?;
        self.read_str(param, &read)
    }

    fn start_sources(&mut self) -> Result<(), SettingsError> {
        let set = self.set;
        let want = StartSources {
            software: set.get_bool(Param::StartOnRunStart)?,
            encoded_clkin: set.get_bool(Param::StartOnEncodedClkin)?,
            sin_level: set.get_bool(Param::StartOnSinLevel)?,
            sin_edge: set.get_bool(Param::StartOnSinEdge)?,
            lvds: set.get_bool(Param::StartOnLvds)?,
            first_trigger: set.get_bool(Param::StartOnFirstTrigger)?,
            p0: set.get_bool(Param::StartOnP0)?,
        };
        self.dev.set_start_sources(&want)?;
        let got = self.dev.get_start_sources()?;

        for (param, read) in [
            (Param::StartOnRunStart, got.software),
            (Param::StartOnEncodedClkin, got.encoded_clkin),
            (Param::StartOnSinLevel, got.sin_level),
            (Param::StartOnSinEdge, got.sin_edge),
            (Param::StartOnLvds, got.lvds),
            (Param::StartOnFirstTrigger, got.first_trigger),
            (Param::StartOnP0, got.p0),
        ] {
            self.read_bool(param, read)?;
        }

        self.dig_u32(Param::RunStartDelay, "RunDelay")
    }

    /// Channel-over-threshold triggers only exist in the scope firmware.
    fn trigger_sources(&mut self, scope_mode: bool) -> Result<(), SettingsError> {
        let set = self.set;
        let want = TriggerSources {
            over_thresh_a: scope_mode && set.get_bool(Param::TriggerOnThreshA)?,
            over_thresh_b: scope_mode && set.get_bool(Param::TriggerOnThreshB)?,
            over_thresh_a_and_b: scope_mode && set.get_bool(Param::TriggerOnThreshAB)?,
            external: set.get_bool(Param::TriggerOnExternal)?,
            software: set.get_bool(Param::TriggerOnSoftware)?,
            user: set.get_bool(Param::TriggerOnUser)?,
            test_pulse: set.get_bool(Param::TriggerOnTestPulse)?,
            lvds: set.get_bool(Param::TriggerOnLvds)?,
        };
        self.dev.set_trigger_sources(&want)?;
        let got = self.dev.get_trigger_sources()?;

        for (param, wanted, read) in [
            (Param::TriggerOnThreshA, want.over_thresh_a, got.over_thresh_a),
            (Param::TriggerOnThreshB, want.over_thresh_b, got.over_thresh_b),
            (Param::TriggerOnThreshAB, want.over_thresh_a_and_b, got.over_thresh_a_and_b),
        ] {
            self.rdb.set_bool(param, read)?;
            self.check(param.name(), &wanted, &read)?;
        }

        for (param, read) in [
            (Param::TriggerOnExternal, got.external),
            (Param::TriggerOnSoftware, got.software),
            (Param::TriggerOnUser, got.user),
            (Param::TriggerOnTestPulse, got.test_pulse),
            (Param::TriggerOnLvds, got.lvds),
        ] {
            self.read_bool(param, read)?;
        }
        Ok(())
    }

    fn readout_mask(&mut self) -> Result<(), SettingsError> {
        let mask = self.set.mask64(Param::ReadoutMaskLow, Param::ReadoutMaskHigh)?;
        self.dev.set_channel_enable_mask(mask)?;
        let read = self.dev.get_channel_enable_mask()?;
        self.read_u32(Param::ReadoutMaskLow, read as u32)?;
        self.read_u32(Param::ReadoutMaskHigh, (read >> 32) as u32)
    }

    fn over_threshold(&mut self) -> Result<(), SettingsError> {
        for (group, mult, low, high) in [
            (
                ItlGroup::A,
                Param::ThreshAMultiplicity,
                Param::ThreshAMaskLow,
                Param::ThreshAMaskHigh,
            ),
            (
                ItlGroup::B,
                Param::ThreshBMultiplicity,
                Param::ThreshBMaskLow,
                Param::ThreshBMaskHigh,
            ),
        ] {
            let multiplicity = self.set.get_u32(mult)?;
            let mask = self.set.mask64(low, high)?;
            self.dev.set_over_threshold_trigger(group, multiplicity, mask)?;
            let (read_mult, read_mask) = self.dev.get_over_threshold_trigger(group)?;
            self.read_u32(mult, read_mult)?;
            self.read_u32(low, read_mask as u32)?;
            self.read_u32(high, (read_mask >> 32) as u32)?;
        }
        Ok(())
    }

    fn front_panel(&mut self) -> Result<(), SettingsError> {
        self.dev.set_nim_ttl(self.set.get_bool(Param::UseNimIo)?)?;
        let nim = self.dev.get_nim_ttl()?;
        self.read_bool(Param::UseNimIo, nim)?;

        self.dev.set_trigout_mode(self.set.get_str(Param::TriggerOutMode)?)?;
        let mode = self.dev.get_trigout_mode()?;
        self.read_str(Param::TriggerOutMode, &mode)?;

        self.dev
            .set_use_external_clock(self.set.get_bool(Param::UseExternalClock)?)?;
        let external = self.dev.get_use_external_clock()?;
        self.read_bool(Param::UseExternalClock, external)?;

        self.dig_bool(Param::EnableClockOut, "EnClockOutFP")?;
        self.dig_str(Param::GpioMode, "GPIOMode")?;
        self.dig_str(Param::SyncOutMode, "SyncOutMode")?;

        self.dev
            .set_enable_fake_sine_data(self.set.get_bool(Param::FakeSineData)?)?;
        let fake = self.dev.get_enable_fake_sine_data()?;
        self.read_bool(Param::FakeSineData, fake)
    }

    fn dc_offsets(&mut self) -> Result<(), SettingsError> {
        self.dig_bool(Param::EnableDcOffsets, "EnOffsetCalibration")?;

        let set = self.set.get_f32_vec(Param::DcOffsetPct)?;
        let mut read = self.rdb.get_f32_vec(Param::DcOffsetPct)?.to_vec();
        for ch in 0..NUM_CHANNELS {
            self.dev.set_chan(ch, "DcOffset", set[ch])?;
            read[ch] = self.dev.get_chan(ch, "DcOffset")?;
            self.check_element(Param::DcOffsetPct, ch, &set[ch], &read[ch])?;
        }
        self.rdb.set(Param::DcOffsetPct, SettingValue::F32Vec(read))
    }

    fn busy_veto(&mut self) -> Result<(), SettingsError> {
        self.dig_str(Param::BusyInSource, "BusyInSource")?;

        let veto = VetoParams {
            source: self.set.get_str(Param::VetoSource)?.to_string(),
            active_high: self.set.get_bool(Param::VetoActiveHigh)?,
            width_ns: self.set.get_u32(Param::VetoWidth)?,
        };
        self.dev.set_veto_params(&veto)?;
        let read = self.dev.get_veto_params()?;
        self.read_str(Param::VetoSource, &read.source)?;
        self.read_bool(Param::VetoActiveHigh, read.active_high)?;
        self.read_u32(Param::VetoWidth, read.width_ns)
    }

    fn lvds(&mut self) -> Result<(), SettingsError> {
        let set_input = self.set.get_bool_vec(Param::LvdsQuartetIsInput)?;
        let set_mode = self.set.get_str_vec(Param::LvdsQuartetMode)?;
        let mut read_input = self.rdb.get_bool_vec(Param::LvdsQuartetIsInput)?.to_vec();
        let mut read_mode = self.rdb.get_str_vec(Param::LvdsQuartetMode)?.to_vec();

        for q in 0..NUM_LVDS_QUARTETS {
            self.dev.set_lvds_quartet(q, set_input[q], &set_mode[q])?;
            let (is_input, mode) = self.dev.get_lvds_quartet(q)?;
            read_input[q] = is_input;
            read_mode[q] = mode;
            self.check_element(Param::LvdsQuartetIsInput, q, &set_input[q], &read_input[q])?;
            self.check_element(Param::LvdsQuartetMode, q, &set_mode[q], &read_mode[q])?;
        }
        self.rdb
            .set(Param::LvdsQuartetIsInput, SettingValue::BoolVec(read_input))?;
        self.rdb
            .set(Param::LvdsQuartetMode, SettingValue::StrVec(read_mode))?;

        let set_low = self.set.get_u32_vec(Param::LvdsTriggerMaskLow)?;
        let set_high = self.set.get_u32_vec(Param::LvdsTriggerMaskHigh)?;
        let mut read_low = self.rdb.get_u32_vec(Param::LvdsTriggerMaskLow)?.to_vec();
        let mut read_high = self.rdb.get_u32_vec(Param::LvdsTriggerMaskHigh)?.to_vec();

        for line in 0..NUM_LVDS_LINES {
            let mask = u64::from(set_low[line]) | (u64::from(set_high[line]) << 32);
            self.dev.set_lvds_trigger_mask(line, mask)?;
            let read = self.dev.get_lvds_trigger_mask(line)?;
            read_low[line] = read as u32;
            read_high[line] = (read >> 32) as u32;
            self.check_element(Param::LvdsTriggerMaskLow, line, &set_low[line], &read_low[line])?;
            self.check_element(Param::LvdsTriggerMaskHigh, line, &set_high[line], &read_high[line])?;
        }
        self.rdb
            .set(Param::LvdsTriggerMaskLow, SettingValue::U32Vec(read_low))?;
        self.rdb
            .set(Param::LvdsTriggerMaskHigh, SettingValue::U32Vec(read_high))?;

        // Input quartets read back the levels on the lines, so only output
        // quartets in IORegister mode are compared.
        let set_io = self.set.get_u16(Param::LvdsIoRegister)?;
        self.dev.set_dig("LVDSIOReg", set_io)?;
        let read_io: u16 = self.dev.get_dig("LVDSIOReg")?;
        self.rdb.set_u16(Param::LvdsIoRegister, read_io)?;

        for q in 0..NUM_LVDS_QUARTETS {
            if set_mode[q] == "IORegister" && !set_input[q] {
                let set_quartet = (set_io >> (q * 4)) & 0xF;
                let read_quartet = (read_io >> (q * 4)) & 0xF;
                self.check(&format!("LVDS IO register quartet{q}"), &set_quartet, &read_quartet)?;
            }
        }
        Ok(())
    }

    fn test_pulse(&mut self) -> Result<(), SettingsError> {
        let pulse = TestPulse {
            period_ms: self.set.get_f64(Param::TestPulsePeriodMs)?,
            width_ns: self.set.get_u32(Param::TestPulseWidth)?,
            low_level_adc: self.set.get_u16(Param::TestPulseLowLevel)?,
            high_level_adc: self.set.get_u16(Param::TestPulseHighLevel)?,
        };
        self.dev.set_test_pulse(&pulse)?;
        let read = self.dev.get_test_pulse()?;

        self.rdb.set_f64(Param::TestPulsePeriodMs, read.period_ms)?;
        self.check(
            Param::TestPulsePeriodMs.name(),
            &pulse.period_ms,
            &read.period_ms,
        )?;
        self.read_u32(Param::TestPulseWidth, read.width_ns)?;
        self.read_u16(Param::TestPulseLowLevel, read.low_level_adc)?;
        self.read_u16(Param::TestPulseHighLevel, read.high_level_adc)
    }

    fn scope_readout(&mut self) -> Result<(), SettingsError> {
        self.dig_u32(Param::TriggerDelay, "TriggerDelayS")?;
        self.dig_u32(Param::WaveformLength, "RecordLengthS")?;
        self.dig_bool(Param::AllowTriggerOverlap, "EnTriggerOverlap")?;
        self.dig_u16(Param::PreTrigger, "PreTriggerS")?;

        self.dev
            .set_trigger_id_mode(self.set.get_str(Param::TriggerIdMode)?)?;
        let mode = self.dev.get_trigger_id_mode()?;
        self.read_str(Param::TriggerIdMode, &mode)
    }

    fn scope_trigger(&mut self) -> Result<(), SettingsError> {
        let relative = self.set.get_bool(Param::RelativeTrigThresholds)?;
        let thresholds = self.set.get_i32_vec(Param::ChanThresholds)?;
        let rising = self.set.get_bool_vec(Param::ChanRisingEdge)?;
        let widths = self.set.get_u32_vec(Param::ChanThreshWidth)?;

        let mut read_thr = self.rdb.get_i32_vec(Param::ChanThresholds)?.to_vec();
        let mut read_rising = self.rdb.get_bool_vec(Param::ChanRisingEdge)?.to_vec();
        let mut read_width = self.rdb.get_u32_vec(Param::ChanThreshWidth)?.to_vec();

        for ch in 0..NUM_CHANNELS {
            let want = ChannelThreshold {
                relative,
                threshold: thresholds[ch],
                rising_edge: rising[ch],
                width_ns: widths[ch],
            };
            self.dev.set_channel_trigger_threshold(ch, &want)?;
            let read = self.dev.get_channel_trigger_threshold(ch)?;
            read_thr[ch] = read.threshold;
            read_rising[ch] = read.rising_edge;
            read_width[ch] = read.width_ns;
            self.rdb.set_bool(Param::RelativeTrigThresholds, read.relative)?;

            self.check(
                &format!("{} for channel {ch}", Param::RelativeTrigThresholds.name()),
                &relative,
                &read.relative,
            )?;
            self.check_element(Param::ChanThresholds, ch, &thresholds[ch], &read_thr[ch])?;
            self.check_element(Param::ChanRisingEdge, ch, &rising[ch], &read_rising[ch])?;
            self.check_element(Param::ChanThreshWidth, ch, &widths[ch], &read_width[ch])?;
        }

        self.rdb.set(Param::ChanThresholds, SettingValue::I32Vec(read_thr))?;
        self.rdb
            .set(Param::ChanRisingEdge, SettingValue::BoolVec(read_rising))?;
        self.rdb
            .set(Param::ChanThreshWidth, SettingValue::U32Vec(read_width))
    }

    fn user_registers(&mut self, fir_gain: u16, fir_discard: u16) -> Result<(), SettingsError> {
        let set = self.set;

        let lvds_out = set.get_u16(Param::UserLvdsOutput)?;
        self.dev.set_user_register(0x44, u32::from(lvds_out))?;
        let read = self.dev.get_user_register_u16(0x44)?;
        self.read_u16(Param::UserLvdsOutput, read)?;

        let mut set_loopback = 0u16;
        if set.get_bool(Param::UserLvdsLoopback)? {
            set_loopback |= 0x1;
        }
        if set.get_bool(Param::UserLvdsPair12Trigger)? {
            set_loopback |= 0x2;
        }
        self.dev.set_user_register(0x50, u32::from(set_loopback))?;
        let read_loopback = self.dev.get_user_register_u16(0x50)?;
        self.check("LVDS loopback", &set_loopback, &read_loopback)?;
        self.rdb
            .set_bool(Param::UserLvdsLoopback, read_loopback & 0x1 != 0)?;
        self.rdb
            .set_bool(Param::UserLvdsPair12Trigger, read_loopback & 0x2 != 0)?;

        // Length registers count in units of 4 samples.
        for (param, base) in [
            (Param::UserWaveformLength, 0x300),
            (Param::UserQshortLength, 0x400),
            (Param::UserQlongLength, 0x500),
        ] {
            let want = set.get_u16_vec(param)?;
            let mut read = self.rdb.get_u16_vec(param)?.to_vec();
            for ch in 0..NUM_CHANNELS {
                let reg = base + 4 * ch as u32;
                self.dev.set_user_register(reg, u32::from(want[ch] / 4))?;
                read[ch] = self.dev.get_user_register_u16(reg)?.wrapping_mul(4);
                self.check_element(param, ch, &want[ch], &read[ch])?;
            }
            self.rdb.set(param, SettingValue::U16Vec(read))?;
        }

        let coeffs = set.get_i16_vec(Param::UserFirCoefficients)?;
        let mut read_coeffs = self.rdb.get_i16_vec(Param::UserFirCoefficients)?.to_vec();
        for (i, &coeff) in coeffs.iter().enumerate() {
            let reg = 0x900 + 4 * i as u32;
            self.dev.set_user_register(reg, coeff as u32)?;
            read_coeffs[i] = self.dev.get_user_register_i16(reg)?;
            self.check_element(Param::UserFirCoefficients, i, &coeff, &read_coeffs[i])?;
        }
        self.rdb
            .set(Param::UserFirCoefficients, SettingValue::I16Vec(read_coeffs))?;

        // Load the new coefficients. Self-clearing.
        self.dev.set_user_register(0x40, 1)?;

        let gain_reg = u32::from(fir_gain) | (u32::from(fir_discard) << 16);
        let mut read_gain = vec![0u32; NUM_CHANNELS];
        for (ch, read) in read_gain.iter_mut().enumerate() {
            let reg = 0xC00 + 4 * ch as u32;
            self.dev.set_user_register(reg, gain_reg)?;
            *read = self.dev.get_user_register(reg)?;
            self.check(&format!("FIR gain and discard for chan {ch}"), &gain_reg, read)?;
        }
        self.rdb
            .set(Param::UserFirGainDiscard, SettingValue::U32Vec(read_gain))?;

        for (param, base) in [
            (Param::UserPreTrigger, 0xB00),
            (Param::UserDarksideThreshold, 0x200),
        ] {
            let want = set.get_u16_vec(param)?;
            let mut read = self.rdb.get_u16_vec(param)?.to_vec();
            for ch in 0..NUM_CHANNELS {
                let reg = base + 4 * ch as u32;
                self.dev.set_user_register(reg, u32::from(want[ch]))?;
                read[ch] = self.dev.get_user_register_u16(reg)?;
                self.check_element(param, ch, &want[ch], &read[ch])?;
            }
            self.rdb.set(param, SettingValue::U16Vec(read))?;
        }

        let ds_low = set.get_u32(Param::UserDarksideMaskLow)?;
        let ds_high = set.get_u32(Param::UserDarksideMaskHigh)?;
        self.dev.set_user_register(0xC, ds_low)?;
        self.dev.set_user_register(0x10, ds_high)?;
        let read_low = self.dev.get_user_register(0xC)?;
        let read_high = self.dev.get_user_register(0x10)?;
        self.rdb.set_u32(Param::UserDarksideMaskLow, read_low)?;
        self.rdb.set_u32(Param::UserDarksideMaskHigh, read_high)?;
        self.check("Darkside trigger en mask(31-0)", &ds_low, &read_low)?;
        self.check("Darkside trigger en mask(63-32)", &ds_high, &read_high)?;

        let sources = channel_trigger_sources(set)?;
        let mut read_sources = vec![0u32; NUM_CHANNELS];
        for ch in 0..NUM_CHANNELS {
            let reg = 0x600 + 4 * ch as u32;
            self.dev.set_user_register(reg, sources[ch])?;
            read_sources[ch] = self.dev.get_user_register(reg)?;
            self.check_element(
                Param::UserChannelTriggerSources,
                ch,
                &sources[ch],
                &read_sources[ch],
            )?;
        }
        self.rdb.set(
            Param::UserChannelTriggerSources,
            SettingValue::U32Vec(read_sources),
        )?;

        let signals = test_signals(set)?;
        let mut read_signals = vec![0u32; NUM_CHANNELS];
        for ch in 0..NUM_CHANNELS {
            let reg = 0x700 + 4 * ch as u32;
            self.dev.set_user_register(reg, signals[ch])?;
            read_signals[ch] = self.dev.get_user_register(reg)?;
            self.check_element(Param::UserTestSignal, ch, &signals[ch], &read_signals[ch])?;
        }
        self.rdb
            .set(Param::UserTestSignal, SettingValue::U32Vec(read_signals))
    }

    fn vga_gain(&mut self) -> Result<(), SettingsError> {
        let set = self.set.get_f32_vec(Param::VgaGain)?;
        let mut read = self.rdb.get_f32_vec(Param::VgaGain)?.to_vec();
        for group in 0..NUM_VGA_GROUPS {
            self.dev.set_vga_gain(group, set[group])?;
            read[group] = self.dev.get_vga_gain(group)?;
            self.check_element(Param::VgaGain, group, &set[group], &read[group])?;
        }
        self.rdb.set(Param::VgaGain, SettingValue::F32Vec(read))
    }
}

/// Per-channel trigger source bits of register 0x600: over threshold (1),
/// external (2), internal (4), global (8).
///
/// Outside expert mode they follow the board-level trigger settings: the
/// global trigger reaches every read-out channel when any board-level
/// source is on, user-mode triggering means over-threshold triggering, and
/// reading every channel on a trigger means internal triggering.
pub fn channel_trigger_sources(set: &BoardSettings) -> Result<Vec<u32>, SettingsError> {
    let (ovth, ext, int, glob) = if set.get_bool(Param::UserExpertTrigMode)? {
        (
            set.mask64(Param::UserTrigThresholdLow, Param::UserTrigThresholdHigh)?,
            set.mask64(Param::UserTrigExternalLow, Param::UserTrigExternalHigh)?,
            set.mask64(Param::UserTrigInternalLow, Param::UserTrigInternalHigh)?,
            set.mask64(Param::UserTrigGlobalLow, Param::UserTrigGlobalHigh)?,
        )
    } else {
        let readout = set.mask64(Param::ReadoutMaskLow, Param::ReadoutMaskHigh)?;
        let any_global = set.get_bool(Param::TriggerOnExternal)?
            || set.get_bool(Param::TriggerOnSoftware)?
            || set.get_bool(Param::TriggerOnTestPulse)?
            || set.get_bool(Param::TriggerOnLvds)?;
        let glob = if any_global { readout } else { 0 };
        let ovth = if set.get_bool(Param::TriggerOnUser)? { readout } else { 0 };
        let int = if set.get_bool(Param::UserOnlyReadTriggeringChannel)? {
            0
        } else {
            readout
        };
        (ovth, 0, int, glob)
    };

    Ok((0..NUM_CHANNELS)
        .map(|ch| {
            let bit = 1u64 << ch;
            let mut mask = 0;
            if ovth & bit != 0 {
                mask |= 1;
            }
            if ext & bit != 0 {
                mask |= 2;
            }
            if int & bit != 0 {
                mask |= 4;
            }
            if glob & bit != 0 {
                mask |= 8;
            }
            mask
        })
        .collect())
}

/// Register 0x700 per channel: bit 6 filter on, bit 7 trigger on falling
/// edge, bit 8 mirror the raw data of channel `ch - 32`, bit 11 write the
/// raw data alongside.
pub fn test_signals(set: &BoardSettings) -> Result<Vec<u32>, SettingsError> {
    let mirror = set.get_bool(Param::UserUpperMirrorsLower)?;
    let falling = set.get_bool(Param::UserTriggerFallingEdge)?;
    let mut en_filt = set.mask64(Param::UserFirEnableLow, Param::UserFirEnableHigh)?;
    if mirror {
        // upper channels carry raw copies
        en_filt &= 0xFFFF_FFFF;
    }

    Ok((0..NUM_CHANNELS)
        .map(|ch| {
            let filtered = en_filt & (1u64 << ch) != 0;
            let mut signal = 0u32;
            if filtered {
                signal |= 1 << 6;
            }
            if falling {
                signal |= 1 << 7;
            }
            if mirror && ch >= 32 {
                signal |= 1 << 8;
            }
            if filtered {
                signal |= 1 << 11;
            }
            signal
        })
        .collect())
}

/// Settings of a front-end group: the group settings, one settings bag per
/// board, readback shared with the readout workers, and the latest errors.
pub struct FeSettings {
    store: Box<dyn SettingsStore>,
    group: GroupSettings,
    boards: Vec<BoardSettings>,
    readback: Vec<Arc<Mutex<BoardReadback>>>,
    errors: Vec<BoardErrors>,
}

impl FeSettings {
    pub fn new(store: Box<dyn SettingsStore>) -> Self {
        Self {
            store,
            group: GroupSettings::default(),
            boards: Vec::new(),
            readback: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn init_store(&mut self, group_index: Option<usize>) -> Result<(), SettingsError> {
        self.store.init(group_index)
    }

    /// Refresh group and board settings from the store.
    pub fn sync_settings_structs(&mut self) -> Result<(), SettingsError> {
        self.store.fill_group_settings(&mut self.group)?;

        let n = self.group.num_boards;
        self.boards.resize_with(n, BoardSettings::default);
        while self.readback.len() < n {
            self.readback.push(Arc::new(Mutex::new(BoardReadback::default())));
        }
        self.errors.resize_with(n, BoardErrors::default);

        for (board_id, board) in self.boards.iter_mut().enumerate() {
            self.store.fill_board_settings(board, board_id)?;
        }
        Ok(())
    }

    pub fn group(&self) -> &GroupSettings {
        &self.group
    }

    pub fn num_boards(&self) -> usize {
        self.group.num_boards
    }

    pub fn board(&self, board_id: usize) -> Result<&BoardSettings, SettingsError> {
        self.boards
            .get(board_id)
            .ok_or_else(|| SettingsError::UnknownParam(format!("board {board_id}")))
    }

    pub fn is_board_enabled(&self, board_id: usize) -> Result<bool, SettingsError> {
        self.board(board_id)?.is_enabled()
    }

    pub fn is_scope_mode(&self, board_id: usize) -> Result<bool, SettingsError> {
        self.board(board_id)?.is_scope_mode()
    }

    pub fn hostname(&self, board_id: usize) -> Result<String, SettingsError> {
        Ok(self.board(board_id)?.hostname()?.to_string())
    }

    pub fn boards_enabled(&self) -> Result<Vec<usize>, SettingsError> {
        let mut enabled = Vec::new();
        for (board_id, board) in self.boards.iter().enumerate() {
            if board.is_enabled()? {
                enabled.push(board_id);
            }
        }
        Ok(enabled)
    }

    /// Enabled boards whose data is read out.
    pub fn boards_to_read_from(&self) -> Result<Vec<usize>, SettingsError> {
        let mut read = Vec::new();
        for (board_id, board) in self.boards.iter().enumerate() {
            if board.is_enabled()? && board.read_data()? {
                read.push(board_id);
            }
        }
        Ok(read)
    }

    pub fn readback(&self, board_id: usize) -> Result<Arc<Mutex<BoardReadback>>, SettingsError> {
        self.readback
            .get(board_id)
            .cloned()
            .ok_or_else(|| SettingsError::UnknownParam(format!("board {board_id}")))
    }

    pub fn errors(&self, board_id: usize) -> Option<&BoardErrors> {
        self.errors.get(board_id)
    }

    pub fn set_board_errors(&mut self, board_id: usize, errors: BoardErrors) {
        if let Some(slot) = self.errors.get_mut(board_id) {
            *slot = errors;
        }
    }

    pub fn write_settings_to_board(&self, board_id: usize, dev: &mut Dig2) -> Result<(), SettingsError> {
        let set = self.board(board_id)?;
        let rdb = self.readback(board_id)?;
        let mut rdb = lock(&rdb);
        write_and_validate(dev, set, &mut rdb, self.group.debug_settings)
    }

    pub fn handle_board_readback_structs(&mut self) -> Result<(), SettingsError> {
        for (board_id, rdb) in self.readback.iter().enumerate() {
            let rdb = lock(rdb).clone();
            self.store.emit_readback(&rdb, board_id)?;
        }
        Ok(())
    }

    pub fn handle_board_errors_structs(&mut self) -> Result<(), SettingsError> {
        for (board_id, errors) in self.errors.iter().enumerate() {
            self.store.emit_errors(errors, board_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimDigitizer};
    use crate::store::ManualStore;

    fn sim_dig(config: SimConfig) -> Dig2 {
        Dig2::from_transport("vx01", Box::new(SimDigitizer::new("vx01", config)))
    }

    #[test]
    fn fir_gain_for_unit_coefficients() {
        let (gain, discard) = compute_fir_gain_and_discard(&[1; 48]).unwrap();
        assert_eq!((gain, discard), (21845, 20));
        assert!(gain < 0x8000);
        // one bit less discarded would need too large a gain
        assert!((1u64 << (56 - 16 - (discard - 1))) / 48 >= 0x8000);
    }

    #[test]
    fn fir_zero_sum_is_rejected() {
        let mut coeffs = vec![1i16; 48];
        coeffs[0] = -47;
        assert!(matches!(
            compute_fir_gain_and_discard(&coeffs),
            Err(SettingsError::Computation(_))
        ));
    }

    #[test]
    fn fir_negative_sum_uses_magnitude() {
        assert_eq!(
            compute_fir_gain_and_discard(&[-1; 48]).unwrap(),
            compute_fir_gain_and_discard(&[1; 48]).unwrap()
        );
    }

    #[test]
    fn comparison_policy() {
        assert!(1.0f32.same(&1.0005));
        assert!(!1.0f32.same(&1.002));
        assert!("Disabled".same("DISABLED"));
        assert!(!5u32.same(&6));
        let err = validate(&true, &false, "Enable clock out", "vx01").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected readback value for 'Enable clock out' of board vx01. Set true, read false."
        );
    }

    #[test]
    fn defaults_sync_cleanly_in_scope_mode() {
        let mut dig = sim_dig(SimConfig::default());
        let set = BoardSettings::default();
        let mut rdb = BoardReadback::default();
        write_and_validate(&mut dig, &set, &mut rdb, false).unwrap();
        assert_eq!(rdb.get_u32(Param::WaveformLength).unwrap(), 1000);
        assert_eq!(rdb.get_f64(Param::TestPulsePeriodMs).unwrap(), 100.0);
        assert_eq!(dig.getvalue("/par/StartSource").unwrap(), "SWcmd");
    }

    #[test]
    fn stuck_boolean_is_a_mismatch() {
        let mut config = SimConfig::default();
        config
            .stuck_values
            .insert("/par/EnClockOutFP".to_string(), "false".to_string());
        let mut dig = sim_dig(config);

        let mut set = BoardSettings::default();
        set.set_bool(Param::EnableClockOut, true).unwrap();
        set.set(Param::DcOffsetPct, SettingValue::F32Vec(vec![20.0; NUM_CHANNELS]))
            .unwrap();
        set.set_f64(Param::TestPulsePeriodMs, 10.0).unwrap();
        let mut rdb = BoardReadback::default();

        match write_and_validate(&mut dig, &set, &mut rdb, false) {
            Err(SettingsError::ConfigMismatch { param, board, set, read }) => {
                assert_eq!(param, "Enable clock out");
                assert_eq!(board, "vx01");
                assert_eq!(set, "true");
                assert_eq!(read, "false");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!rdb.get_bool(Param::EnableClockOut).unwrap());

        // groups after the front panel were never written
        assert_eq!(dig.getvalue("/ch/0/par/DcOffset").unwrap(), "50");
        assert_eq!(dig.getvalue("/par/TestPulsePeriod").unwrap(), "100000");
        assert_eq!(rdb.get_f32_vec(Param::DcOffsetPct).unwrap()[0], 50.0);
    }

    #[test]
    fn array_mismatch_names_the_element() {
        let mut config = SimConfig::default();
        config
            .stuck_values
            .insert("/ch/7/par/DcOffset".to_string(), "10".to_string());
        let mut dig = sim_dig(config);
        let set = BoardSettings::default();
        let mut rdb = BoardReadback::default();

        match write_and_validate(&mut dig, &set, &mut rdb, false) {
            Err(SettingsError::ConfigMismatch { param, .. }) => assert_eq!(param, "DC offset (pct)[7]"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_fir_fails_before_any_write() {
        let mut dig = sim_dig(SimConfig::open_dpp());
        let mut set = BoardSettings::default();
        set.set_bool(Param::ScopeMode, false).unwrap();
        let mut coeffs = vec![0i16; 48];
        coeffs[3] = 5;
        coeffs[4] = -5;
        set.set(Param::UserFirCoefficients, SettingValue::I16Vec(coeffs))
            .unwrap();
        let mut rdb = BoardReadback::default();

        let err = write_and_validate(&mut dig, &set, &mut rdb, false).unwrap_err();
        assert!(matches!(err, SettingsError::Computation(_)));
        assert_eq!(dig.getvalue("/par/StartSource").unwrap(), "");
        assert_eq!(dig.get_user_register(0x900).unwrap(), 0);
    }

    #[test]
    fn user_mode_registers() {
        let mut dig = sim_dig(SimConfig::open_dpp());
        let mut set = BoardSettings::default();
        set.set_bool(Param::ScopeMode, false).unwrap();
        set.set_bool(Param::TriggerOnThreshA, true).unwrap();
        let mut rdb = BoardReadback::default();

        write_and_validate(&mut dig, &set, &mut rdb, false).unwrap();

        // ITL sources are dropped outside scope mode
        assert!(!rdb.get_bool(Param::TriggerOnThreshA).unwrap());
        assert_eq!(dig.get_user_register(0x300).unwrap(), 250);
        assert_eq!(dig.get_user_register(0xC00).unwrap(), 21845 | (20 << 16));
        // external and software triggers are on by default
        assert_eq!(dig.get_user_register(0x600).unwrap(), 8);
        assert_eq!(
            rdb.get_u32_vec(Param::UserFirGainDiscard).unwrap()[63],
            21845 | (20 << 16)
        );
    }

    #[test]
    fn user_pre_trigger_limit() {
        let mut dig = sim_dig(SimConfig::open_dpp());
        let mut set = BoardSettings::default();
        set.set_bool(Param::ScopeMode, false).unwrap();
        let mut pre = vec![100u16; 64];
        pre[5] = 0x1000;
        set.set(Param::UserPreTrigger, SettingValue::U16Vec(pre)).unwrap();
        let mut rdb = BoardReadback::default();
        assert!(matches!(
            write_and_validate(&mut dig, &set, &mut rdb, false),
            Err(SettingsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn trigger_source_bits() {
        let mut set = BoardSettings::default();
        set.set_u32(Param::ReadoutMaskHigh, 0).unwrap();
        set.set_bool(Param::TriggerOnUser, true).unwrap();
        set.set_bool(Param::UserOnlyReadTriggeringChannel, false)
            .unwrap();
        let sources = channel_trigger_sources(&set).unwrap();
        assert_eq!(sources[0], 1 | 4 | 8);
        assert_eq!(sources[40], 0);

        set.set_bool(Param::UserExpertTrigMode, true).unwrap();
        set.set_u32(Param::UserTrigExternalLow, 0b10).unwrap();
        let sources = channel_trigger_sources(&set).unwrap();
        assert_eq!(sources[0], 0);
        assert_eq!(sources[1], 2);
    }

    #[test]
    fn test_signal_bits() {
        let mut set = BoardSettings::default();
        set.set_u32(Param::UserFirEnableLow, 1).unwrap();
        set.set_u32(Param::UserFirEnableHigh, 1).unwrap();
        let signals = test_signals(&set).unwrap();
        assert_eq!(signals[0], (1 << 6) | (1 << 7) | (1 << 11));
        assert_eq!(signals[1], 1 << 7);
        // mirror on by default: no filter above 32
        assert_eq!(signals[32], (1 << 7) | (1 << 8));
    }

    #[test]
    fn fe_settings_layers_store_values() {
        let mut board = BoardSettings::default();
        board.set_str(Param::Hostname, "vx01").unwrap();
        let mut second = BoardSettings::default();
        second.set_bool(Param::ReadData, false).unwrap();
        let group = GroupSettings {
            num_boards: 2,
            ..Default::default()
        };
        let mut fe = FeSettings::new(Box::new(ManualStore::new(group, vec![board, second])));
        fe.sync_settings_structs().unwrap();

        assert_eq!(fe.num_boards(), 2);
        assert_eq!(fe.hostname(0).unwrap(), "vx01");
        assert_eq!(fe.boards_enabled().unwrap(), vec![0, 1]);
        assert_eq!(fe.boards_to_read_from().unwrap(), vec![0]);
        assert!(fe.board(2).is_err());
    }
}
