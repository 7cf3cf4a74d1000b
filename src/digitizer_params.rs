use crate::dig2::Dig2;
use crate::params::{chan_path, dig_path, lvds_path, vga_path};
use log::info;

const DIGITIZER_PARAMS: &[&str] = &[
    "cupver",
    "FwType",
    "ModelName",
    "SerialNum",
    "NumCh",
    "ADC_Nbit",
    "ADC_SamplRate",
    "ClockSource",
    "EnClockOutFP",
    "StartSource",
    "AcqTriggerSource",
    "TrgOutMode",
    "GPIOMode",
    "BusyInSource",
    "SyncOutMode",
    "VetoSource",
    "VetoWidth",
    "VetoPolarity",
    "RunDelay",
    "EnTriggerOverlap",
    "TriggerIDMode",
    "AcquisitionStatus",
    "RecordLengthS",
    "MaxRawDataSize",
    "PreTriggerS",
    "TriggerDelayS",
    "TestPulsePeriod",
    "TestPulseWidth",
    "TestPulseLowLevel",
    "TestPulseHighLevel",
    "IOlevel",
    "TempSensAirIn",
    "TempSensAirOut",
    "TempSensHottestADC",
    "ErrorFlags",
    "ITLAMainLogic",
    "ITLBMainLogic",
    "ITLAMajorityLev",
    "ITLBMajorityLev",
    "ITLAPairLogic",
    "ITLBPairLogic",
    "ITLAMask",
    "ITLBMask",
    "LVDSIOReg",
    "EnOffsetCalibration",
];

const CHANNEL_PARAMS: &[&str] = &[
    "ChEnable",
    "DcOffset",
    "WaveDataSource",
    "TriggerThr",
    "TriggerThrMode",
    "SelfTriggerEdge",
    "SelfTriggerWidth",
];

/// Read every known parameter of one board as `path = value` lines.
/// Parameters the board does not have are left out.
pub fn dump(dev: &mut Dig2, all_channels: bool) -> String {
    let mut lines = Vec::new();
    let mut push = |dev: &mut Dig2, path: String| {
        if let Ok(value) = dev.getvalue(&path) {
            lines.push(format!("{path} = {value}"));
        }
    };

    for &param in DIGITIZER_PARAMS {
        push(dev, dig_path(param));
    }

    let num_channels = dev
        .getvalue(&dig_path("NumCh"))
        .ok()
        .and_then(|n| n.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let channels = if all_channels { num_channels } else { num_channels.min(1) };
    for &param in CHANNEL_PARAMS {
        for ch in 0..channels {
            push(dev, chan_path(ch, param));
        }
    }

    for quartet in 0..4 {
        push(dev, lvds_path(quartet, "LVDSDirection"));
        push(dev, lvds_path(quartet, "LVDSMode"));
    }
    for group in 0..4 {
        push(dev, vga_path(group, "VGAGain"));
    }

    lines.join("\n")
}

/// Log the parameters of every board at info level.
pub fn log_all<'a>(boards: impl IntoIterator<Item = (usize, &'a mut Dig2)>, all_channels: bool) {
    for (board_id, dev) in boards {
        let param_log = dump(dev, all_channels);
        info!("Digitizer {board_id} ({}) parameters:\n{param_log}", dev.name());
    }
}
