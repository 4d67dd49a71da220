mod event;
mod intro;
mod screen;

use std::cell::Cell;
use std::io::{self, Stdout};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::{
    event::{self as term, Event as CEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout},
    style::{Color, Style},
    text::Line,
    widgets::Paragraph,
    Terminal,
};

use cue_config::Config;
use cue_core::{
    bus::EventBus,
    clock::FrameClock,
    logging::{self, LogOptions},
    scheduler::ScriptScheduler,
    task::TaskHandle,
    timer::{CatchUp, TimerScheduler},
};

use event::Event;
use screen::{Screen, SharedScreen};

const SCREEN_ROWS: usize = 8;
const HEARTBEAT_SECS: f64 = 1.0;

struct App {
    bus: EventBus<Event>,
    timers: TimerScheduler,
    scripts: ScriptScheduler,
    screen: SharedScreen,
    clock: FrameClock,
    intro: TaskHandle,
    quit: Rc<Cell<bool>>,
    beats: Rc<Cell<u64>>,
    tick: Duration,
}

impl App {
    fn new(config: &Config) -> Self {
        let bus = EventBus::new();
        let timers = TimerScheduler::new().with_catch_up(CatchUp::from(&config.timers));
        let scripts = ScriptScheduler::new();
        let screen = Screen::shared(SCREEN_ROWS);

        let quit = Rc::new(Cell::new(false));
        {
            let quit = quit.clone();
            bus.connect(move |ev: &Event| {
                if matches!(ev, Event::Quit) {
                    tracing::info!("quit requested");
                    quit.set(true);
                }
                Ok(())
            });
        }
        bus.connect(|ev: &Event| {
            if let Event::Resize { cols, rows } = ev {
                tracing::debug!(cols, rows, "terminal resized");
            }
            Ok(())
        });

        let beats = Rc::new(Cell::new(0));
        {
            let beats = beats.clone();
            timers.every(HEARTBEAT_SECS, move || {
                beats.set(beats.get() + 1);
                Ok(())
            });
        }

        let intro = scripts.spawn_named("intro", intro::intro(&screen, &bus));
        Self {
            bus,
            timers,
            scripts,
            screen,
            clock: FrameClock::new(config.frame.max_dt),
            intro,
            quit,
            beats,
            tick: Duration::from_millis(config.frame.tick_ms),
        }
    }

    /// One frame: timers first, then scripts. Restarts the intro once it ends.
    fn update(&mut self, dt: f64) -> Result<()> {
        self.timers.update(dt).context("timer update failed")?;
        self.scripts.update(dt)?;

        if self.intro.is_finished() {
            tracing::info!(intro = %self.intro.id(), "intro finished, restarting");
            self.intro = self
                .scripts
                .spawn_named("intro", intro::intro(&self.screen, &self.bus));
        }
        Ok(())
    }

    fn status_line(&self) -> String {
        format!(
            "fps {:>5.1} | t {:>7.2}s | beats {} | tasks {} | timers {} | listeners {} | intro {}",
            self.clock.fps(),
            self.clock.elapsed(),
            self.beats.get(),
            self.scripts.len(),
            self.timers.len(),
            self.bus.len(),
            self.intro.state(),
        )
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&LogOptions::from(&config.log))?;
    tracing::info!(?config, "cue starting up");

    let mut terminal = setup_terminal()?;
    let res = run(&mut terminal, &config);
    restore_terminal(terminal)?;
    if let Err(err) = &res {
        tracing::error!(error = %format!("{:#}", err), "frame loop aborted");
    }
    res
}

fn run(terminal: &mut Terminal<CrosstermBackend<Stdout>>, config: &Config) -> Result<()> {
    let mut app = App::new(config);

    loop {
        // ── Poll → Dispatch ──
        if term::poll(app.tick)? {
            match term::read()? {
                CEvent::Key(key) if key.kind == KeyEventKind::Press => {
                    app.bus.dispatch(&Event::from_key(key))?;
                }
                CEvent::Resize(cols, rows) => {
                    app.bus.dispatch(&Event::Resize { cols, rows })?;
                }
                _ => {}
            }
        }
        if app.quit.get() {
            app.scripts.stop_all();
            app.timers.clear();
            return Ok(());
        }

        // ── Update ──
        let dt = app.clock.tick(Instant::now());
        app.update(dt)?;

        // ── Render ──
        let (lines, height) = {
            let screen = app.screen.borrow();
            (screen.lines(), screen.height() as u16)
        };
        let status = app.status_line();
        terminal.draw(|f| {
            let [body, _, footer] = Layout::vertical([
                Constraint::Length(height),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .areas(f.area());
            f.render_widget(Paragraph::new(lines), body);
            f.render_widget(
                Paragraph::new(Line::from(status)).style(Style::default().fg(Color::DarkGray)),
                footer,
            );
        })?;
    }
}
