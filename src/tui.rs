use crate::config::RunSettings;
use crate::group::{BoardSummary, GroupController};
use crate::reader::ReaderState;
use crate::sink::EventSink;
use crate::utils::{format_bytes, Counter};
use crate::writer::{next_run_file, Hdf5Sink, WriterOptions};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{error, info, warn};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Span, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const REFRESH: Duration = Duration::from_millis(250);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const MAX_EVENTS_PER_POLL: usize = 1000;

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub campaign: usize,
    pub run_duration: Duration,
    pub metadata_period: Duration,
    pub error_check_period: Duration,
    pub writer: WriterOptions,
}

impl From<&RunSettings> for RunOptions {
    fn from(run: &RunSettings) -> Self {
        Self {
            output_dir: PathBuf::from(&run.output_dir),
            campaign: run.campaign_num,
            run_duration: Duration::from_secs(run.run_duration),
            metadata_period: Duration::from_millis(run.metadata_period_ms),
            error_check_period: Duration::from_millis(run.error_check_period_ms),
            writer: WriterOptions {
                max_events_per_file: run.max_events_per_file,
                buffer_events: run.write_buffer_events,
                compression_level: run.compression_level,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Timeout,
    EmergencyStop,
}

#[derive(Debug)]
pub struct Status {
    pub counter: Counter,
    pub t_begin: Instant,
    pub run_num: usize,
    pub boards: Vec<BoardSummary>,
    pub exit: Option<StatusExit>,
    options: RunOptions,
    last_metadata: Instant,
    last_error_check: Instant,
}

impl Status {
    pub fn new(options: RunOptions) -> Self {
        Self {
            counter: Counter::default(),
            t_begin: Instant::now(),
            run_num: 0,
            boards: Vec::new(),
            exit: None,
            options,
            last_metadata: Instant::now(),
            last_error_check: Instant::now(),
        }
    }

    /// Take runs until the operator quits, the run is stopped on corrupt
    /// data, or `max_runs` runs have rolled over. Without a terminal the
    /// loop runs headless.
    pub fn run(
        &mut self,
        daq: &mut GroupController,
        mut terminal: Option<&mut DefaultTerminal>,
        max_runs: Option<usize>,
    ) -> Result<()> {
        let ticker = tick(REFRESH);
        let mut runs_done = 0;

        loop {
            let (run_num, path) = next_run_file(&self.options.output_dir, self.options.campaign)?;
            let mut sink = Hdf5Sink::create(&path, self.options.writer.clone())?;
            self.begin_run(daq, run_num)?;

            while self.exit.is_none() {
                let drained = self.poll(daq, &mut sink)?;

                match ticker.try_recv() {
                    Ok(_) => {
                        self.counter.evict(Instant::now());
                        self.boards = daq.board_summaries();
                        if let Some(term) = terminal.as_mut() {
                            self.handle_events(daq)?;
                            term.draw(|f| self.draw(f))?;
                        }
                    }
                    Err(_) if drained == 0 => thread::sleep(IDLE_SLEEP),
                    Err(_) => {}
                }
            }

            daq.end_of_run()?;
            sink.close()?;
            info!(
                "Run {run_num} finished: {} events, {}",
                self.counter.n_events,
                format_bytes(self.counter.total_size)
            );

            runs_done += 1;
            match self.exit {
                Some(StatusExit::Quit) | Some(StatusExit::EmergencyStop) => return Ok(()),
                _ if max_runs.is_some_and(|max| runs_done >= max) => return Ok(()),
                _ => {}
            }
        }
    }

    fn begin_run(&mut self, daq: &mut GroupController, run_num: usize) -> Result<()> {
        self.run_num = run_num;
        self.exit = None;
        self.counter.reset();
        daq.begin_of_run(run_num as u32)?;

        self.t_begin = Instant::now();
        self.last_metadata = self.t_begin;
        self.last_error_check = self.t_begin;
        self.boards = daq.board_summaries();
        Ok(())
    }

    /// Move ready events to the sink and run the periodic checks. Returns
    /// how many events were written.
    fn poll(&mut self, daq: &mut GroupController, sink: &mut Hdf5Sink) -> Result<usize> {
        let mut drained = 0;
        while drained < MAX_EVENTS_PER_POLL {
            let Some(event) = daq.write_data()? else {
                break;
            };
            self.counter.increment(event.size_bytes());
            sink.write_event(&event)?;
            drained += 1;
        }

        if daq.emergency_stop_requested() {
            error!("Stopping run {} because of corrupt data", self.run_num);
            self.exit = Some(StatusExit::EmergencyStop);
        }

        if self.last_metadata.elapsed() >= self.options.metadata_period {
            sink.write_metadata(&daq.write_metadata()?)?;
            self.last_metadata = Instant::now();
        }

        if self.last_error_check.elapsed() >= self.options.error_check_period {
            if let Err(e) = daq.check_errors() {
                warn!("Error check failed: {e}");
            }
            self.last_error_check = Instant::now();
        }

        if self.exit.is_none() && self.t_begin.elapsed() >= self.options.run_duration {
            self.exit = Some(StatusExit::Timeout);
        }
        Ok(drained)
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self, daq: &mut GroupController) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event, daq)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent, daq: &mut GroupController) {
        match key_event.code {
            KeyCode::Char('q') => self.exit = Some(StatusExit::Quit),
            KeyCode::Char('t') => {
                if let Err(e) = daq.send_sw_trigger() {
                    warn!("Software trigger failed: {e}");
                }
            }
            _ => {}
        }
    }
}

fn board_line(board: &BoardSummary) -> Line<'static> {
    let state: Span = match board.state {
        ReaderState::Error => board.state.name().red().bold(),
        ReaderState::Running | ReaderState::Armed => board.state.name().green(),
        _ => board.state.name().yellow(),
    };
    let mut spans = vec![
        format!(" {:02} {:<20} ", board.board_id, board.name).into(),
        state,
        " Ring buffer: ".into(),
        format_bytes(board.ring_level).yellow(),
        " Read: ".into(),
        format_bytes(board.bytes_read as usize).yellow(),
    ];
    if board.alarm {
        spans.push(" ALARM".red().bold());
    }
    Line::from(spans)
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(
            format!(
                " Campaign {} Run {} Status ",
                self.options.campaign, self.run_num
            )
            .bold(),
        );
        let instructions = Line::from(vec![
            " Trigger ".into(),
            "<T>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let mut lines = vec![Line::from(vec![
            "Elapsed time: ".into(),
            self.t_begin.elapsed().as_secs().to_string().yellow(),
            " s".into(),
            " Events: ".into(),
            self.counter.n_events.to_string().yellow(),
            " Event rate: ".into(),
            format!("{:.1}", self.counter.event_rate()).yellow(),
            " Hz".into(),
            " Data rate: ".into(),
            format!("{:.2}", self.counter.rate()).yellow(),
            " MB/s".into(),
        ])];
        lines.extend(self.boards.iter().map(board_line));

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{BoardSettings, GroupSettings, Param, ParamBag};
    use crate::sim::{SimConfig, SimConnector};
    use crate::store::ManualStore;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn options(dir: PathBuf) -> RunOptions {
        RunOptions {
            output_dir: dir,
            campaign: 2,
            run_duration: Duration::from_millis(400),
            metadata_period: Duration::from_millis(100),
            error_check_period: Duration::from_millis(100),
            writer: WriterOptions {
                max_events_per_file: 1000,
                buffer_events: 10,
                compression_level: 0,
            },
        }
    }

    #[test]
    fn status_panel_shows_run_and_boards() {
        let mut status = Status::new(options(PathBuf::from("/tmp")));
        status.run_num = 12;
        status.boards = vec![BoardSummary {
            board_id: 0,
            name: "vx01".to_string(),
            state: ReaderState::Running,
            ring_level: 2048,
            bytes_read: 0,
            alarm: true,
        }];

        let area = Rect::new(0, 0, 100, 6);
        let mut buf = Buffer::empty(area);
        (&status).render(area, &mut buf);
        let text: String = buf.content().iter().map(|cell| cell.symbol()).collect();
        assert!(text.contains("Campaign 2 Run 12 Status"));
        assert!(text.contains("vx01"));
        assert!(text.contains("2.0 kB"));
        assert!(text.contains("ALARM"));
    }

    #[test]
    fn headless_runs_roll_over_into_files() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("vx2740-tui-{nanos}"));

        let mut board = BoardSettings::default();
        board.set_str(Param::Hostname, "vx01").unwrap();
        board.set_u32(Param::ReadTimeoutMs, 10).unwrap();
        let store = ManualStore::new(GroupSettings::default(), vec![board]);
        let connector = SimConnector::new(SimConfig {
            trigger_rate_hz: 200.0,
            ..SimConfig::default()
        });
        let mut daq = GroupController::new(Box::new(connector), Box::new(store), None, 4 << 20, true);
        daq.init().unwrap();

        let mut status = Status::new(options(dir.clone()));
        status.run(&mut daq, None, Some(2)).unwrap();

        assert_eq!(status.exit, Some(StatusExit::Timeout));
        assert_eq!(status.run_num, 1);
        assert!(dir.join("camp2/run0_0.h5").exists());
        assert!(dir.join("camp2/run1_0.h5").exists());
        assert!(status.counter.n_events > 0);
    }
}
