use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use vx2740_daq::{Conf, FileStore, GroupController, RunOptions, SimConfig, SimConnector, Status};

/// Front end for one group of VX2740 digitizers.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Settings file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Group of boards this front end reads. Without it all boards in the
    /// file belong to this front end.
    #[arg(short, long)]
    group_index: Option<usize>,

    /// Log to the terminal instead of showing the status display
    #[arg(long)]
    headless: bool,

    /// Where the log goes while the status display is up
    #[arg(long, default_value = "vx2740_group_fe.log")]
    log_file: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    /// Configure and arm the boards without reading their data
    #[arg(long)]
    no_readout: bool,

    /// Stop after this many runs
    #[arg(long)]
    runs: Option<usize>,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Off)
        .set_location_level(LevelFilter::Off)
        .build();

    if args.headless {
        TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto)?;
    } else {
        let file = File::create(&args.log_file)
            .with_context(|| format!("creating log file {}", args.log_file.display()))?;
        WriteLogger::init(level, config, file)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let conf = Conf::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    hdf5::filters::blosc_set_nthreads(conf.run_settings.blosc_threads);

    let connector = SimConnector::new(SimConfig::from(&conf.sim_settings));
    let store = FileStore::new(&args.config);
    let mut daq = GroupController::new(
        Box::new(connector),
        Box::new(store),
        args.group_index,
        conf.run_settings.ring_buffer_mb * 1_000_000,
        !args.no_readout,
    );
    daq.init()?;

    let mut status = Status::new(RunOptions::from(&conf.run_settings));
    let result = if args.headless {
        status.run(&mut daq, None, args.runs)
    } else {
        let mut terminal = ratatui::init();
        let result = status.run(&mut daq, Some(&mut terminal), args.runs);
        ratatui::restore();
        result
    };

    daq.shutdown()?;
    info!("Front end stopped");
    result
}
