//! trapwm - a keyboard-driven frame window manager for X11.
//!
//! Every screen is partitioned into frames; each frame shows at most one
//! window. A prefix key switches the manager into a one-keystroke command
//! mode, and a property-based remote protocol lets external processes run
//! the same commands (see the bundled `trapctl`).

mod bar;
mod command;
mod config;
mod conn;
mod event;
mod frames;
mod keys;
mod manage;
mod registry;
mod screen;
mod signals;
mod tracing;
mod types;
mod window;
mod x11;

use anyhow::Result;
use clap::Parser;

use bar::BarState;
use config::Config;
use conn::{DisplayConn, IcccmState};
use keys::KeyBindings;
use registry::WindowRegistry;
use screen::Screen;
use signals::BarTimer;
use tracing::EventTracer;
use x11::X11Conn;

/// trapwm - keyboard-driven frame window manager
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// X display to manage (default: $DISPLAY)
    #[arg(long)]
    display: Option<String>,
}

/// The whole manager state, threaded explicitly through every handler.
pub struct Wm<C: DisplayConn> {
    pub conn: C,
    pub config: Config,
    pub keys: KeyBindings,
    pub screens: Vec<Screen>,
    pub registry: WindowRegistry,
    pub current_screen: usize,
    pub current_window: Option<conn::WindowHandle>,
    /// Set while a destroy burst containing the current window drains
    pub switch_window_pending: bool,
    pub bar: BarState,
    pub tracer: EventTracer,
    pub timer: BarTimer,
    /// Monotonic stamp source for window access ordering
    pub access_counter: u64,
    pub running: bool,
}

impl<C: DisplayConn> Wm<C> {
    pub fn new(conn: C, config: Config) -> Result<Self> {
        Self::with_timer(conn, config, BarTimer::system())
    }

    pub fn with_timer(mut conn: C, config: Config, timer: BarTimer) -> Result<Self> {
        let keys = KeyBindings::from_config(&config);
        let handles = conn.screens()?;
        anyhow::ensure!(!handles.is_empty(), "display has no screens");

        let mut screens = Vec::with_capacity(handles.len());
        for h in handles {
            conn.become_wm(h.root)?;
            screens.push(Screen::from_handles(h));
        }

        let mut wm = Self {
            conn,
            config,
            keys,
            screens,
            registry: WindowRegistry::new(),
            current_screen: 0,
            current_window: None,
            switch_window_pending: false,
            bar: BarState::default(),
            tracer: EventTracer::new(),
            timer,
            access_counter: 0,
            running: true,
        };
        wm.adopt_existing_windows()?;
        Ok(wm)
    }

    /// Adopt windows that were already on screen when the manager started.
    /// They enter Iconic without stealing focus; the first one is shown.
    fn adopt_existing_windows(&mut self) -> Result<()> {
        for screen in 0..self.screens.len() {
            let root = self.screens[screen].root;
            for window in self.conn.existing_windows(root)? {
                if self.screens[screen].is_helper(window) {
                    continue;
                }
                if self.registry.create(window, screen) {
                    self.manage(window)?;
                    self.conn.begin_ignore_errors();
                    self.conn.unmap_window(window)?;
                    self.conn.set_icccm_state(window, IcccmState::Iconic)?;
                    self.conn.end_ignore_errors();
                    log::info!("Adopted existing window 0x{:x}", window);
                }
            }
        }
        let first = self.registry.mapped().next().map(|r| r.handle);
        if let Some(window) = first {
            self.set_active_window(window)?;
        }
        self.conn.flush()?;
        Ok(())
    }

    /// The main loop: latched signal flags are consulted once per iteration,
    /// buffered events are served before blocking, and protocol errors
    /// accumulated outside ignore scopes surface as one notification.
    pub fn run(&mut self, argv: &[String]) -> Result<()> {
        log::info!("Entering event loop");
        while self.running {
            if signals::take_terminate() {
                log::info!("Terminate signal received");
                break;
            }
            if signals::take_reload() {
                log::info!("Reloading: re-exec with original arguments");
                self.cleanup();
                return signals::exec_self(argv);
            }
            if signals::take_alarm() {
                self.hide_transient_ui_everywhere()?;
            }

            match self.conn.next_event() {
                Ok(Some(event)) => {
                    if let Err(e) = self.dispatch(event) {
                        log::error!("Error handling event: {}", e);
                    }
                }
                Ok(None) => continue, // interrupted by a signal; re-check flags
                Err(e) => {
                    log::error!("Connection lost: {}", e);
                    return Err(e);
                }
            }

            if let Some(report) = self.conn.take_error_report() {
                let screen = self.current_screen;
                self.marked_message(screen, &report)?;
            }
        }
        self.cleanup();
        log::info!("Exiting window manager");
        Ok(())
    }

    /// Put clients back into a sane state before exit or re-exec.
    fn cleanup(&mut self) {
        let mapped: Vec<conn::WindowHandle> = self.registry.mapped().map(|r| r.handle).collect();
        self.conn.begin_ignore_errors();
        for window in mapped {
            let _ = self.conn.map_window(window);
            let _ = self.conn.set_icccm_state(window, IcccmState::Normal);
            let _ = self.conn.ungrab_keys(window);
        }
        self.conn.end_ignore_errors();
        let _ = self.conn.flush();
    }
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let argv: Vec<String> = std::env::args().collect();

    log::info!("Starting trapwm");

    signals::install()?;

    let conn = X11Conn::connect(cli.display.as_deref())?;
    let config = Config::load();
    let mut wm = Wm::new(conn, config)?;
    wm.run(&argv)
}
