// src/main.rs
use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::Stdout;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossterm::event::{self, DisableFocusChange, EnableFocusChange, Event as CEvent, KeyEvent, KeyEventKind};
use crossterm::{execute, terminal::{EnterAlternateScreen, LeaveAlternateScreen}};
use ratatui::{backend::CrosstermBackend, Terminal};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter, prelude::*, Registry};

mod app;
mod auth;
mod callback;
mod config;
mod error;
mod model;
mod pkce;
mod session;
mod spotify;
mod store;
mod sync;
mod timer;
mod ui;

use app::{Action, App, WELCOME_DURATION, handle_key};
use config::Config;
use model::{AppEvent, AppScreen};
use session::Session;
use ui::draw_ui;

/// A loop iteration this far behind the wall clock means the process was
/// suspended; the countdown is resynced from its deadline.
const SUSPEND_GAP: time::Duration = time::Duration::seconds(2);
const TIMER_TICK: Duration = Duration::from_secs(1);

type Term = Terminal<CrosstermBackend<Stdout>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // parse flags
    let args: Vec<String> = env::args().collect();
    let debug_mode = args.iter().any(|s| s == "--debug");

    // initialize tracing to file only when --debug is passed
    if debug_mode {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open("tomatune.log")?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let fmt_layer = fmt::layer().with_writer(Mutex::new(file)).with_target(false);
        Registry::default().with(filter).with(fmt_layer).init();
        info!("Tracing initialized to tomatune.log (debug)");
    }

    info!("Starting tomatune");

    // Fail on bad configuration before the terminal is taken over
    let config = Config::from_env()?;

    let (tx, rx) = mpsc::unbounded_channel::<AppEvent>();
    let mut session = Session::init(config, tx)?;
    let mut app = App::new(
        session.config().timer,
        session.config().guard_window,
        session.is_logged_in(),
    );

    // Terminal setup
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    crossterm::terminal::enable_raw_mode()?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &mut app, &mut session, rx).await;

    // Cleanup
    session.teardown();
    if session.has_background_tasks() {
        warn!("Background tasks still running at exit");
    }
    crossterm::terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), DisableFocusChange, LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    info!("Exiting tomatune");
    result
}

async fn run(
    terminal: &mut Term,
    app: &mut App,
    session: &mut Session,
    mut rx: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<(), Box<dyn Error>> {
    let tick_rate = Duration::from_millis(50);
    let mut last_tick = Instant::now();
    let mut last_timer_tick = Instant::now();
    let mut last_wall = OffsetDateTime::now_utc();

    loop {
        let now = OffsetDateTime::now_utc();
        if now - last_wall > SUSPEND_GAP {
            debug!("Wall clock jumped by {}, resyncing timer", now - last_wall);
            app.resync(now);
        }
        last_wall = now;

        // Advance the countdown; transitions may ask for a playback change
        if last_timer_tick.elapsed() >= TIMER_TICK {
            if let Some(command) = app.tick(now) {
                session.send_playback(command);
            }
            last_timer_tick = Instant::now();
        }

        // Advance spinner + redraw periodically
        if last_tick.elapsed() >= tick_rate {
            if app.loading {
                app.throbber_state.calc_next();
            }
            terminal.draw(|f| draw_ui(f, app)).ok();
            last_tick = Instant::now();
        }

        // Auto-dismiss welcome screen after 1.5s
        if app.screen == AppScreen::Welcome && app.welcome_shown_at.elapsed() >= WELCOME_DURATION {
            app.leave_welcome();
        }

        // Drain background events
        while let Ok(ev) = rx.try_recv() {
            handle_event(app, session, ev);
        }

        // Input handling
        if event::poll(Duration::from_millis(20))? {
            match event::read()? {
                CEvent::Key(KeyEvent { code, kind: KeyEventKind::Press, .. }) => {
                    match handle_key(app, code, OffsetDateTime::now_utc()) {
                        Action::None => {}
                        Action::Quit => break,
                        Action::Playback(command) => session.send_playback(command),
                        Action::Login => begin_login(app, session),
                        Action::Logout => {
                            if let Err(e) = session.logout() {
                                warn!("Logout could not clear storage: {}", e);
                            }
                            app.on_logged_out(Some("Logged out".into()));
                        }
                    }
                }
                CEvent::FocusGained => {
                    debug!("Focus regained, resyncing timer");
                    app.resync(OffsetDateTime::now_utc());
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn handle_event(app: &mut App, session: &mut Session, ev: AppEvent) {
    match ev {
        AppEvent::LoggedIn => {
            info!("Login completed");
            session.resume();
            app.on_logged_in();
        }
        AppEvent::LoginFailed(msg) => {
            app.loading = false;
            app.message = Some(format!("Login failed: {}", msg));
        }
        AppEvent::ProfileLoaded(profile) if app.logged_in => {
            debug!("Profile loaded for {}", profile.id);
            app.profile = Some(profile);
        }
        AppEvent::ProfileLoaded(_) => {}
        AppEvent::PlaybackPolled { snapshot, requested_at } => {
            app.on_playback(snapshot, requested_at, OffsetDateTime::now_utc());
        }
        AppEvent::PollFailed(msg) => {
            app.loading = false;
            app.message = Some(format!("Could not read playback: {}", msg));
        }
        AppEvent::CommandFailed(msg) => {
            app.message = Some(format!("Playback command failed: {}", msg));
        }
        AppEvent::SessionExpired(msg) if !app.logged_in => {
            // a request from the previous session; a new login may be pending
            debug!("Ignoring expiry after logout: {}", msg);
        }
        AppEvent::SessionExpired(msg) => {
            warn!("Session expired: {}", msg);
            if let Err(e) = session.logout() {
                warn!("Logout could not clear storage: {}", e);
            }
            app.on_logged_out(Some(format!("Session expired, please log in again ({})", msg)));
        }
        AppEvent::Message(msg) => {
            warn!("Background message: {}", msg);
            app.message = Some(msg);
        }
    }
}

fn begin_login(app: &mut App, session: &mut Session) {
    match session.begin_login() {
        Ok(url) => {
            app.loading = true;
            app.message = Some("Waiting for authorization in the browser...".into());
            if let Err(e) = open::that(&url) {
                warn!("Could not open browser: {}", e);
                app.message = Some(format!("Could not open a browser: {}", e));
            }
            app.login_url = Some(url);
        }
        Err(e) => {
            app.message = Some(format!("Could not start login: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn logged_out_session(dir: &std::path::Path) -> (Session, mpsc::UnboundedReceiver<AppEvent>) {
        let vars: HashMap<&str, String> = HashMap::from([
            ("TOMATUNE_CLIENT_ID", "client-123".to_string()),
            ("TOMATUNE_ACCOUNTS_URL", "http://127.0.0.1:9".to_string()),
            ("TOMATUNE_API_URL", "http://127.0.0.1:9".to_string()),
            ("TOMATUNE_STORAGE_PATH", dir.join("s.json").display().to_string()),
            ("TOMATUNE_REDIRECT_URI", "http://127.0.0.1:0/callback".to_string()),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::init(config, tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_stale_expiry_keeps_pending_login() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _rx) = logged_out_session(dir.path());
        let mut app = App::new(session.config().timer, session.config().guard_window, false);
        app.leave_welcome();

        app.login_url = Some(session.begin_login().unwrap());
        assert!(session.has_background_tasks());

        handle_event(&mut app, &mut session, AppEvent::SessionExpired("no refresh token stored".into()));
        assert!(session.has_background_tasks());
        assert_eq!(app.screen, AppScreen::Login);
        assert!(app.login_url.is_some());
    }
}
