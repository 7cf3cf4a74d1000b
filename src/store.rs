//! Where group and board settings come from, and where readback and error
//! records go.
//!
//! [`FileStore`] reads the application TOML file, re-reading it at every
//! sync so edits apply at the next begin-of-run, and writes readback and
//! error tables to their own files. [`ManualStore`] serves literal settings
//! and records what was emitted, for tests and embedding.

use crate::config::{Conf, ScalarConfig, SettingConfig};
use crate::error::SettingsError;
use crate::settings::{
    BoardErrors, BoardReadback, BoardSettings, GroupSettings, Param, ParamBag, SettingValue,
};
use crate::utils::lock;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

pub trait SettingsStore: Send {
    /// Called once before the first sync. `group_index` is `None` for a
    /// single front end.
    fn init(&mut self, group_index: Option<usize>) -> Result<(), SettingsError>;
    fn fill_group_settings(&mut self, group: &mut GroupSettings) -> Result<(), SettingsError>;
    fn fill_board_settings(
        &mut self,
        board: &mut BoardSettings,
        board_id: usize,
    ) -> Result<(), SettingsError>;
    fn emit_readback(&mut self, readback: &BoardReadback, board_id: usize) -> Result<(), SettingsError>;
    fn emit_errors(&mut self, errors: &BoardErrors, board_id: usize) -> Result<(), SettingsError>;
}

/// Everything a [`ManualStore`] has been handed.
#[derive(Debug, Default)]
pub struct ManualRecord {
    pub readback: BTreeMap<usize, BoardReadback>,
    pub errors: BTreeMap<usize, BoardErrors>,
}

pub struct ManualStore {
    group: GroupSettings,
    boards: Vec<BoardSettings>,
    record: Arc<Mutex<ManualRecord>>,
}

impl ManualStore {
    pub fn new(group: GroupSettings, boards: Vec<BoardSettings>) -> Self {
        Self {
            group,
            boards,
            record: Arc::new(Mutex::new(ManualRecord::default())),
        }
    }

    /// Handle to the emitted records that stays valid after the store is
    /// moved into [`crate::sync::FeSettings`].
    pub fn record(&self) -> Arc<Mutex<ManualRecord>> {
        Arc::clone(&self.record)
    }
}

impl SettingsStore for ManualStore {
    fn init(&mut self, _group_index: Option<usize>) -> Result<(), SettingsError> {
        Ok(())
    }

    fn fill_group_settings(&mut self, group: &mut GroupSettings) -> Result<(), SettingsError> {
        *group = self.group.clone();
        Ok(())
    }

    fn fill_board_settings(
        &mut self,
        board: &mut BoardSettings,
        board_id: usize,
    ) -> Result<(), SettingsError> {
        *board = self.boards.get(board_id).cloned().unwrap_or_default();
        Ok(())
    }

    fn emit_readback(&mut self, readback: &BoardReadback, board_id: usize) -> Result<(), SettingsError> {
        lock(&self.record).readback.insert(board_id, readback.clone());
        Ok(())
    }

    fn emit_errors(&mut self, errors: &BoardErrors, board_id: usize) -> Result<(), SettingsError> {
        lock(&self.record).errors.insert(board_id, errors.clone());
        Ok(())
    }
}

pub struct FileStore {
    path: PathBuf,
    group_index: Option<usize>,
    readback_path: Option<PathBuf>,
    errors_path: Option<PathBuf>,
    readback: BTreeMap<usize, toml::Table>,
    errors: BTreeMap<usize, toml::Table>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            group_index: None,
            readback_path: None,
            errors_path: None,
            readback: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    fn load(&self) -> Result<Conf, SettingsError> {
        Conf::from_file(&self.path)
            .map_err(|e| SettingsError::Store(format!("{}: {e}", self.path.display())))
    }
}

impl SettingsStore for FileStore {
    fn init(&mut self, group_index: Option<usize>) -> Result<(), SettingsError> {
        let conf = self.load()?;
        self.group_index = group_index;
        self.readback_path = conf.run_settings.readback_file.map(PathBuf::from);
        self.errors_path = conf.run_settings.errors_file.map(PathBuf::from);

        match group_index {
            Some(index) => info!("Group {index} uses settings from {}", self.path.display()),
            None => info!("Using settings from {}", self.path.display()),
        }
        Ok(())
    }

    fn fill_group_settings(&mut self, group: &mut GroupSettings) -> Result<(), SettingsError> {
        let g = self.load()?.group_settings;
        *group = GroupSettings {
            num_boards: g.num_boards,
            merge_data_using_event_id: g.merge_data_using_event_id,
            debug_data: g.debug_data,
            debug_rates: g.debug_rates,
            debug_settings: g.debug_settings,
            debug_ring_buffers: g.debug_ring_buffers,
            multithreaded_readout: g.multithreaded_readout,
        };
        Ok(())
    }

    fn fill_board_settings(
        &mut self,
        board: &mut BoardSettings,
        board_id: usize,
    ) -> Result<(), SettingsError> {
        let conf = self.load()?.board_settings;
        let mut settings = BoardSettings::default();

        if let Some(defaults) = &conf.defaults {
            apply_settings(&mut settings, defaults)?;
        }
        if let Some(overrides) = conf.boards.as_ref().and_then(|b| b.get(board_id)) {
            apply_settings(&mut settings, overrides)?;
        }

        *board = settings;
        Ok(())
    }

    fn emit_readback(&mut self, readback: &BoardReadback, board_id: usize) -> Result<(), SettingsError> {
        let Some(path) = self.readback_path.clone() else {
            return Ok(());
        };

        let mut table: toml::Table = readback
            .values()
            .iter()
            .map(|(param, value)| (param.name().to_string(), to_toml(value)))
            .collect();
        table.insert("Last update".to_string(), unix_now());
        self.readback.insert(board_id, table);
        write_tables(&path, &self.readback)
    }

    fn emit_errors(&mut self, errors: &BoardErrors, board_id: usize) -> Result<(), SettingsError> {
        let Some(path) = self.errors_path.clone() else {
            return Ok(());
        };

        let mut table = toml::Table::new();
        table.insert(
            "Error bitmask".to_string(),
            toml::Value::Integer(i64::from(errors.bitmask)),
        );
        table.insert(
            "Error message".to_string(),
            toml::Value::String(errors.message.clone()),
        );
        table.insert("Last update".to_string(), unix_now());
        self.errors.insert(board_id, table);
        write_tables(&path, &self.errors)
    }
}

fn unix_now() -> toml::Value {
    toml::Value::Integer(OffsetDateTime::now_utc().unix_timestamp())
}

fn write_tables(path: &Path, tables: &BTreeMap<usize, toml::Table>) -> Result<(), SettingsError> {
    let doc: toml::Table = tables
        .iter()
        .map(|(board_id, table)| (format!("board{board_id:02}"), toml::Value::Table(table.clone())))
        .collect();
    let text = toml::to_string(&doc).map_err(|e| SettingsError::Store(e.to_string()))?;
    fs::write(path, text)
        .map_err(|e| SettingsError::Store(format!("{}: {e}", path.display())))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

fn to_toml(value: &SettingValue) -> toml::Value {
    use toml::Value;

    fn array<T>(values: &[T], f: impl Fn(&T) -> Value) -> Value {
        Value::Array(values.iter().map(f).collect())
    }

    match value {
        SettingValue::Str(v) => Value::String(v.clone()),
        SettingValue::Bool(v) => Value::Boolean(*v),
        SettingValue::U16(v) => Value::Integer(i64::from(*v)),
        SettingValue::U32(v) => Value::Integer(i64::from(*v)),
        SettingValue::I32(v) => Value::Integer(i64::from(*v)),
        SettingValue::F64(v) => Value::Float(*v),
        SettingValue::BoolVec(v) => array(v, |x| Value::Boolean(*x)),
        SettingValue::StrVec(v) => array(v, |x| Value::String(x.clone())),
        SettingValue::I16Vec(v) => array(v, |x| Value::Integer(i64::from(*x))),
        SettingValue::U16Vec(v) => array(v, |x| Value::Integer(i64::from(*x))),
        SettingValue::U32Vec(v) => array(v, |x| Value::Integer(i64::from(*x))),
        SettingValue::I32Vec(v) => array(v, |x| Value::Integer(i64::from(*x))),
        SettingValue::F32Vec(v) => array(v, |x| Value::Float(f64::from(*x))),
    }
}

/// Layer a table of named values over `settings`.
pub fn apply_settings(
    settings: &mut BoardSettings,
    table: &HashMap<String, SettingConfig>,
) -> Result<(), SettingsError> {
    for (name, config) in table {
        let param = Param::from_name(name)
            .filter(Param::is_setting)
            .ok_or_else(|| SettingsError::UnknownParam(name.clone()))?;
        let value = coerce(param, settings.value(param)?, config)?;
        settings.set(param, value)?;
    }
    Ok(())
}

fn invalid(param: Param, message: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue {
        param: param.name().to_string(),
        message: message.into(),
    }
}

/// Convert a file value to the shape of `current`.
fn coerce(
    param: Param,
    current: &SettingValue,
    config: &SettingConfig,
) -> Result<SettingValue, SettingsError> {
    use SettingValue as V;

    let single = || match config {
        SettingConfig::Global(v) => Ok(v),
        _ => Err(invalid(param, "expected a single value")),
    };

    Ok(match current {
        V::Str(_) => V::Str(to_string(param, single()?)?),
        V::Bool(_) => V::Bool(to_bool(param, single()?)?),
        V::U16(_) => V::U16(to_int(param, single()?)?),
        V::U32(_) => V::U32(to_int(param, single()?)?),
        V::I32(_) => V::I32(to_int(param, single()?)?),
        V::F64(_) => V::F64(to_float(param, single()?)?),
        V::BoolVec(cur) => V::BoolVec(elements(param, cur, config, to_bool)?),
        V::StrVec(cur) => V::StrVec(elements(param, cur, config, to_string)?),
        V::I16Vec(cur) => V::I16Vec(elements(param, cur, config, to_int::<i16>)?),
        V::U16Vec(cur) => V::U16Vec(elements(param, cur, config, to_int::<u16>)?),
        V::U32Vec(cur) => V::U32Vec(elements(param, cur, config, to_int::<u32>)?),
        V::I32Vec(cur) => V::I32Vec(elements(param, cur, config, to_int::<i32>)?),
        V::F32Vec(cur) => V::F32Vec(elements(param, cur, config, |p, v| {
            to_float(p, v).map(|f| f as f32)
        })?),
    })
}

fn elements<T: Clone>(
    param: Param,
    current: &[T],
    config: &SettingConfig,
    convert: impl Fn(Param, &ScalarConfig) -> Result<T, SettingsError>,
) -> Result<Vec<T>, SettingsError> {
    match config {
        SettingConfig::Global(v) => Ok(vec![convert(param, v)?; current.len()]),
        SettingConfig::List(values) => {
            if values.len() != current.len() {
                return Err(invalid(
                    param,
                    format!("expected {} values, got {}", current.len(), values.len()),
                ));
            }
            values.iter().map(|v| convert(param, v)).collect()
        }
        SettingConfig::PerElement(map) => {
            let mut out = current.to_vec();
            for (key, v) in map {
                let slot = key
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| out.get_mut(idx))
                    .ok_or_else(|| invalid(param, format!("no element '{key}'")))?;
                *slot = convert(param, v)?;
            }
            Ok(out)
        }
    }
}

fn to_string(param: Param, v: &ScalarConfig) -> Result<String, SettingsError> {
    match v {
        ScalarConfig::Str(s) => Ok(s.clone()),
        other => Err(invalid(param, format!("expected a string, got {other:?}"))),
    }
}

fn to_bool(param: Param, v: &ScalarConfig) -> Result<bool, SettingsError> {
    match v {
        ScalarConfig::Bool(b) => Ok(*b),
        other => Err(invalid(param, format!("expected true/false, got {other:?}"))),
    }
}

fn to_int<T: TryFrom<i64>>(param: Param, v: &ScalarConfig) -> Result<T, SettingsError> {
    match v {
        ScalarConfig::Int(i) => T::try_from(*i).map_err(|_| {
            invalid(
                param,
                format!("{i} does not fit in {}", std::any::type_name::<T>()),
            )
        }),
        other => Err(invalid(param, format!("expected an integer, got {other:?}"))),
    }
}

fn to_float(param: Param, v: &ScalarConfig) -> Result<f64, SettingsError> {
    match v {
        ScalarConfig::Float(f) => Ok(*f),
        ScalarConfig::Int(i) => Ok(*i as f64),
        other => Err(invalid(param, format!("expected a number, got {other:?}"))),
    }
}
