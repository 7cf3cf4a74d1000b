use crate::event::{decode_event, ByteOrder};
use crate::sink::{Bank, EventSink, GroupEvent};
use anyhow::{anyhow, Context, Result};
use hdf5::{Dataset, File, Group};
use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Events per board before the next file of the run is opened.
    pub max_events_per_file: usize,
    /// Events held in memory per board between writes.
    pub buffer_events: usize,
    /// Blosc zstd level; 0 disables compression.
    pub compression_level: u8,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_events_per_file: 10000,
            buffer_events: 100,
            compression_level: 0,
        }
    }
}

/// Create `<output_dir>/camp<N>` if needed and pick the first file of the
/// next run in it. Returns the run number and the file path.
pub fn next_run_file(output_dir: impl AsRef<Path>, campaign: usize) -> Result<(usize, PathBuf)> {
    let camp_dir = output_dir.as_ref().join(format!("camp{campaign}"));
    if !camp_dir.exists() {
        fs::create_dir_all(&camp_dir)
            .with_context(|| format!("creating campaign directory {}", camp_dir.display()))?;
        info!("Created campaign directory {}", camp_dir.display());
    }

    let max_run = fs::read_dir(&camp_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let stripped = name.to_str()?.strip_prefix("run")?;
            stripped.split('_').next()?.parse::<usize>().ok()
        })
        .max();

    let run = max_run.map_or(0, |max| max + 1);
    Ok((run, camp_dir.join(format!("run{run}_0.h5"))))
}

/// Writes data banks into one HDF5 group per bank name, plus a metadata
/// table. A run spans `run<M>_0.h5`, `run<M>_1.h5`, ... as files fill up.
pub struct Hdf5Sink {
    dir: PathBuf,
    run: usize,
    sub_run: usize,
    options: WriterOptions,
    file: File,
    boards: BTreeMap<String, BoardData>,
    metadata: Vec<[u32; 5]>,
}

impl Hdf5Sink {
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref();
        let (dir, run, sub_run) = parse_run_path(path)?;
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        info!("Writing run {run} to {}", path.display());

        Ok(Self {
            dir,
            run,
            sub_run,
            options,
            file,
            boards: BTreeMap::new(),
            metadata: Vec::new(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("run{}_{}.h5", self.run, self.sub_run))
    }

    pub fn run(&self) -> usize {
        self.run
    }

    /// Write everything still buffered and finish the file.
    pub fn close(mut self) -> Result<()> {
        self.finish_file()?;
        info!("Closed {}", self.path().display());
        Ok(())
    }

    fn append_data_bank(&mut self, bank: &Bank) -> Result<()> {
        let event = decode_event(&bank.data, ByteOrder::Host)?;
        if !event.header.is_waveform() {
            debug!(
                "Skipping special event of format 0x{:x} in {}",
                event.header.format, bank.name
            );
            return Ok(());
        }

        let waveforms = event.waveforms();
        let (n_channels, n_samples) = waveforms.dim();

        if self
            .boards
            .get(&bank.name)
            .is_some_and(|board| board.is_full())
        {
            self.roll_over()?;
        }

        if !self.boards.contains_key(&bank.name) {
            let group = self.file.create_group(&bank.name)?;
            let board = BoardData::new(
                &group,
                n_channels,
                n_samples,
                event.header.ch_enable_mask,
                &self.options,
            )?;
            self.boards.insert(bank.name.clone(), board);
        }

        let board = self
            .boards
            .get_mut(&bank.name)
            .ok_or_else(|| anyhow!("no datasets for {}", bank.name))?;
        board.append_event(event.header.trigger_time, event.header.event_counter, &waveforms)
    }

    /// Finish the current file and continue in the next one of the run.
    fn roll_over(&mut self) -> Result<()> {
        self.finish_file()?;
        self.sub_run += 1;
        let path = self.path();
        self.file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        info!("Continuing run {} in {}", self.run, path.display());
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        for board in self.boards.values_mut() {
            board.flush()?;
            board.write_count()?;
        }
        self.boards.clear();
        self.write_metadata_table()?;
        self.file.flush()?;
        Ok(())
    }

    fn write_metadata_table(&mut self) -> Result<()> {
        if self.metadata.is_empty() {
            return Ok(());
        }
        let rows = self.metadata.len();
        let table = Array2::from_shape_vec((rows, 5), self.metadata.concat())?;
        self.file
            .new_dataset::<u32>()
            .shape((rows, 5))
            .create("metadata")?
            .write(&table)?;
        self.metadata.clear();
        Ok(())
    }
}

impl EventSink for Hdf5Sink {
    fn write_event(&mut self, event: &GroupEvent) -> Result<()> {
        for bank in event.banks.iter().filter(|b| b.name.starts_with('D')) {
            self.append_data_bank(bank)
                .with_context(|| format!("writing {}", bank.name))?;
        }
        Ok(())
    }

    /// Rows of (board, status, air-in temperature, hottest ADC temperature,
    /// error flags).
    fn write_metadata(&mut self, event: &GroupEvent) -> Result<()> {
        for bank in &event.banks {
            if let (Some(board_id), Some(words)) = (bank.board_id(), bank.metadata_words()) {
                self.metadata
                    .push([board_id as u32, words[0], words[1], words[2], words[3]]);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for board in self.boards.values_mut() {
            board.flush()?;
        }
        self.file.flush()?;
        Ok(())
    }
}

fn parse_run_path(path: &Path) -> Result<(PathBuf, usize, usize)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("bad run file name {}", path.display()))?;
    let (run, sub_run) = stem
        .strip_prefix("run")
        .and_then(|rest| rest.split_once('_'))
        .ok_or_else(|| anyhow!("run file {} is not run<M>_<K>.h5", path.display()))?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((dir, run.parse()?, sub_run.parse()?))
}

/// HDF5 datasets and buffering for one board.
struct BoardData {
    current_event: usize,
    max_events: usize,
    group: Group,
    timestamps: Dataset,
    event_counters: Dataset,
    waveforms: Dataset,
    buffer_capacity: usize,
    buffer_count: usize,
    ts_buffer: Array1<u64>,
    counter_buffer: Array1<u32>,
    wf_buffer: Array3<u16>,
    n_channels: usize,
    n_samples: usize,
}

impl BoardData {
    fn new(
        group: &Group,
        n_channels: usize,
        n_samples: usize,
        channel_mask: u64,
        options: &WriterOptions,
    ) -> Result<Self> {
        let max_events = options.max_events_per_file.max(1);
        let buffer_capacity = options.buffer_events.clamp(1, max_events);

        let timestamps = group
            .new_dataset::<u64>()
            .shape(max_events)
            .chunk(buffer_capacity)
            .create("timestamps")?;
        let event_counters = group
            .new_dataset::<u32>()
            .shape(max_events)
            .chunk(buffer_capacity)
            .create("event_counters")?;

        let builder = group
            .new_dataset::<u16>()
            .shape((max_events, n_channels, n_samples))
            .chunk((buffer_capacity, n_channels.max(1), n_samples.max(1)));
        let waveforms = if options.compression_level > 0 {
            builder
                .blosc_zstd(options.compression_level, true)
                .create("waveforms")?
        } else {
            builder.create("waveforms")?
        };

        group
            .new_attr::<u64>()
            .create("channel_mask")?
            .write_scalar(&channel_mask)?;

        Ok(Self {
            current_event: 0,
            max_events,
            group: group.clone(),
            timestamps,
            event_counters,
            waveforms,
            buffer_capacity,
            buffer_count: 0,
            ts_buffer: Array1::zeros(buffer_capacity),
            counter_buffer: Array1::zeros(buffer_capacity),
            wf_buffer: Array3::zeros((buffer_capacity, n_channels, n_samples)),
            n_channels,
            n_samples,
        })
    }

    fn is_full(&self) -> bool {
        self.current_event + self.buffer_count >= self.max_events
    }

    fn append_event(&mut self, timestamp: u64, counter: u32, waveforms: &Array2<u16>) -> Result<()> {
        let (channels, samples) = waveforms.dim();
        if channels != self.n_channels || samples != self.n_samples {
            return Err(anyhow!(
                "event is {channels}x{samples}, datasets hold {}x{}",
                self.n_channels,
                self.n_samples
            ));
        }
        if self.is_full() {
            return Err(anyhow!("maximum number of events reached"));
        }

        self.ts_buffer[self.buffer_count] = timestamp;
        self.counter_buffer[self.buffer_count] = counter;
        self.wf_buffer
            .slice_mut(s![self.buffer_count, .., ..])
            .assign(waveforms);
        self.buffer_count += 1;

        if self.buffer_count == self.buffer_capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer_count == 0 {
            return Ok(());
        }
        let rows = self.current_event..self.current_event + self.buffer_count;

        self.timestamps
            .write_slice(&self.ts_buffer.slice(s![..self.buffer_count]), rows.clone())?;
        self.event_counters
            .write_slice(&self.counter_buffer.slice(s![..self.buffer_count]), rows.clone())?;
        self.waveforms.write_slice(
            &self.wf_buffer.slice(s![..self.buffer_count, .., ..]),
            (rows, .., ..),
        )?;

        self.current_event += self.buffer_count;
        self.buffer_count = 0;
        Ok(())
    }

    /// Record how many rows of the fixed-size datasets hold events.
    fn write_count(&self) -> Result<()> {
        self.group
            .new_attr::<u64>()
            .create("n_events")?
            .write_scalar(&(self.current_event as u64))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::pack_waveform_event;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("vx2740-{name}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn data_bank(board_id: usize, counter: u32, time: u64) -> Bank {
        let waveforms = Array2::from_shape_fn((2, 8), |(c, s)| (c * 100 + s) as u16);
        let mut bytes = Vec::new();
        pack_waveform_event(counter, time, 0, 0b101, &waveforms, ByteOrder::Host, &mut bytes);
        Bank::data_bank(board_id, bytes)
    }

    #[test]
    fn run_numbers_follow_existing_files() {
        let dir = scratch_dir("runs");
        let (run, path) = next_run_file(&dir, 4).unwrap();
        assert_eq!(run, 0);
        assert_eq!(path, dir.join("camp4/run0_0.h5"));

        fs::write(dir.join("camp4/run0_0.h5"), b"").unwrap();
        fs::write(dir.join("camp4/run6_1.h5"), b"").unwrap();
        fs::write(dir.join("camp4/notes.txt"), b"").unwrap();
        let (run, path) = next_run_file(&dir, 4).unwrap();
        assert_eq!(run, 7);
        assert!(path.ends_with("run7_0.h5"));
    }

    #[test]
    fn events_and_metadata_land_in_the_file() {
        let dir = scratch_dir("write");
        let path = dir.join("run3_0.h5");
        let options = WriterOptions {
            max_events_per_file: 10,
            buffer_events: 2,
            compression_level: 0,
        };
        let mut sink = Hdf5Sink::create(&path, options).unwrap();
        assert_eq!(sink.run(), 3);

        for i in 0..3 {
            let event = GroupEvent {
                trigger_mask: 0,
                banks: vec![data_bank(1, i, 1000 + i as u64)],
            };
            sink.write_event(&event).unwrap();
        }
        let meta = GroupEvent {
            trigger_mask: 0,
            banks: vec![Bank::metadata_bank(1, [3, 31, 52, 0])],
        };
        sink.write_metadata(&meta).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();

        let file = File::open(&path).unwrap();
        let group = file.group("D001").unwrap();
        let counters: Vec<u32> = group.dataset("event_counters").unwrap().read_raw().unwrap();
        assert_eq!(&counters[..3], &[0, 1, 2]);
        let shape = group.dataset("waveforms").unwrap().shape();
        assert_eq!(shape, vec![10, 2, 8]);
        let n: u64 = group.attr("n_events").unwrap().read_scalar().unwrap();
        assert_eq!(n, 3);

        let metadata: Vec<u32> = file.dataset("metadata").unwrap().read_raw().unwrap();
        assert_eq!(metadata, vec![1, 3, 31, 52, 0]);
    }

    #[test]
    fn full_files_roll_over() {
        let dir = scratch_dir("rollover");
        let options = WriterOptions {
            max_events_per_file: 2,
            buffer_events: 2,
            compression_level: 0,
        };
        let mut sink = Hdf5Sink::create(dir.join("run0_0.h5"), options).unwrap();
        for i in 0..3 {
            let event = GroupEvent {
                trigger_mask: 0,
                banks: vec![data_bank(0, i, i as u64)],
            };
            sink.write_event(&event).unwrap();
        }
        assert_eq!(sink.path(), dir.join("run0_1.h5"));
        sink.close().unwrap();

        let second = File::open(dir.join("run0_1.h5")).unwrap();
        let counters: Vec<u32> = second
            .group("D000")
            .unwrap()
            .dataset("event_counters")
            .unwrap()
            .read_raw()
            .unwrap();
        assert_eq!(counters[0], 2);
    }
}
