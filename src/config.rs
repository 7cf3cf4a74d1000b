use crate::sim::SimConfig;
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub group_settings: GroupConfig,
    #[config(nested)]
    pub board_settings: BoardConfig,
    #[config(nested)]
    pub sim_settings: SimSettings,
}

impl Conf {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, confique::Error> {
        Conf::builder().file(path.as_ref()).load()
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    pub output_dir: String,
    #[config(default = 0)]
    pub campaign_num: usize,
    /// Seconds before a run rolls over.
    #[config(default = 600)]
    pub run_duration: u64,
    #[config(default = 1000)]
    pub ring_buffer_mb: usize,
    #[config(default = 10000)]
    pub max_events_per_file: usize,
    #[config(default = 100)]
    pub write_buffer_events: usize,
    #[config(default = 6000)]
    pub metadata_period_ms: u64,
    #[config(default = 1000)]
    pub error_check_period_ms: u64,
    pub readback_file: Option<String>,
    pub errors_file: Option<String>,
    #[config(default = 5)]
    pub blosc_threads: u8,
    #[config(default = 2)]
    pub compression_level: u8,
}

#[derive(Config, Debug, Clone)]
pub struct GroupConfig {
    #[config(default = 1)]
    pub num_boards: usize,
    #[config(default = false)]
    pub merge_data_using_event_id: bool,
    #[config(default = false)]
    pub debug_data: bool,
    #[config(default = false)]
    pub debug_rates: bool,
    #[config(default = false)]
    pub debug_settings: bool,
    #[config(default = false)]
    pub debug_ring_buffers: bool,
    #[config(default = true)]
    pub multithreaded_readout: bool,
}

/// Board parameters keyed by their human-readable names. `defaults`
/// applies to every board; entry `i` of `boards` overrides board `i`.
#[derive(Config, Debug, Clone)]
pub struct BoardConfig {
    pub defaults: Option<HashMap<String, SettingConfig>>,
    pub boards: Option<Vec<HashMap<String, SettingConfig>>>,
}

#[derive(Config, Debug, Clone)]
pub struct SimSettings {
    #[config(default = "Scope")]
    pub firmware_type: String,
    #[config(default = "2023030100")]
    pub firmware_version: String,
    #[config(default = "VX2740")]
    pub model_name: String,
    #[config(default = 100.0)]
    pub trigger_rate_hz: f64,
}

impl From<&SimSettings> for SimConfig {
    fn from(settings: &SimSettings) -> Self {
        SimConfig {
            firmware_type: settings.firmware_type.clone(),
            firmware_version: settings.firmware_version.clone(),
            model_name: settings.model_name.clone(),
            trigger_rate_hz: settings.trigger_rate_hz,
            ..SimConfig::default()
        }
    }
}

/// Value of one board parameter in the file.
///
/// A single value sets a scalar, or every element of an array parameter.
/// A list replaces a whole array. A table keyed by element index
/// overrides just those elements.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum SettingConfig {
    Global(ScalarConfig),
    List(Vec<ScalarConfig>),
    PerElement(HashMap<String, ScalarConfig>),
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ScalarConfig {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_shapes_deserialize() {
        let table: HashMap<String, SettingConfig> = toml::from_str(
            r#"
            "Enable" = true
            "Waveform length (samples)" = 2048
            "Test pulse period (ms)" = 0.5
            "Trigger out mode" = "SwTrg"
            "VGA gain" = [1.0, 2, 3.5, 4]
            "DC offset (pct)" = { "3" = 20.0 }
            "#,
        )
        .unwrap();

        assert_eq!(table["Enable"], SettingConfig::Global(ScalarConfig::Bool(true)));
        assert_eq!(
            table["Waveform length (samples)"],
            SettingConfig::Global(ScalarConfig::Int(2048))
        );
        assert_eq!(
            table["Test pulse period (ms)"],
            SettingConfig::Global(ScalarConfig::Float(0.5))
        );
        assert!(matches!(&table["VGA gain"], SettingConfig::List(v) if v.len() == 4));
        assert!(matches!(&table["DC offset (pct)"], SettingConfig::PerElement(m) if m.contains_key("3")));
    }

    #[test]
    fn sim_settings_map_onto_the_simulator() {
        let settings = SimSettings {
            firmware_type: "DPP_OPEN".to_string(),
            firmware_version: "1".to_string(),
            model_name: "VX2745".to_string(),
            trigger_rate_hz: 5.0,
        };
        let config = SimConfig::from(&settings);
        assert_eq!(config.firmware_type, "DPP_OPEN");
        assert_eq!(config.model_name, "VX2745");
        assert!(config.stuck_values.is_empty());
    }
}
