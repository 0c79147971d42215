use std::time::{Duration, Instant};

use crossterm::event::KeyCode;
use throbber_widgets_tui::ThrobberState;
use time::OffsetDateTime;
use tracing::debug;

use crate::model::{AppScreen, PlaybackSnapshot, Profile};
use crate::sync::{ExternalChange, PlaybackCommand, Synchronizer};
use crate::timer::{PomodoroTimer, TimerEvent, TimerSettings};

pub const WELCOME_DURATION: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Classic,
    Short,
    Long,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Classic, Preset::Short, Preset::Long];

    pub fn settings(self) -> TimerSettings {
        match self {
            Preset::Classic => TimerSettings { work_minutes: 25, break_minutes: 5, total_cycles: 4 },
            Preset::Short => TimerSettings { work_minutes: 15, break_minutes: 3, total_cycles: 4 },
            Preset::Long => TimerSettings { work_minutes: 50, break_minutes: 10, total_cycles: 2 },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Preset::Classic => "Classic",
            Preset::Short => "Short",
            Preset::Long => "Long",
        }
    }

    fn from_key(c: char) -> Option<Self> {
        match c {
            '1' => Some(Preset::Classic),
            '2' => Some(Preset::Short),
            '3' => Some(Preset::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    WorkMinutes,
    BreakMinutes,
    Cycles,
}

/// What the event loop has to do after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Quit,
    Login,
    Logout,
    Playback(PlaybackCommand),
}

pub struct App {
    pub screen: AppScreen,
    pub timer: PomodoroTimer,
    pub sync: Synchronizer,
    pub profile: Option<Profile>,
    pub playback: Option<PlaybackSnapshot>,
    pub message: Option<String>,
    pub login_url: Option<String>,
    pub logged_in: bool,
    pub throbber_state: ThrobberState,
    pub loading: bool,
    pub welcome_shown_at: Instant,
}

impl App {
    pub fn new(settings: TimerSettings, guard_window: Duration, logged_in: bool) -> Self {
        Self {
            screen: AppScreen::Welcome,
            timer: PomodoroTimer::new(settings),
            sync: Synchronizer::new(guard_window),
            profile: None,
            playback: None,
            message: None,
            login_url: None,
            logged_in,
            throbber_state: ThrobberState::default(),
            loading: logged_in,
            welcome_shown_at: Instant::now(),
        }
    }

    pub fn leave_welcome(&mut self) {
        if self.screen == AppScreen::Welcome {
            self.screen = if self.logged_in { AppScreen::Timer } else { AppScreen::Login };
        }
    }

    pub fn toggle_running(&mut self, now: OffsetDateTime) -> Option<PlaybackCommand> {
        let event = if self.timer.is_running() {
            self.timer.pause(now)
        } else {
            self.timer.start(now)
        };
        self.react(event, now)
    }

    pub fn reset(&mut self, now: OffsetDateTime) -> Option<PlaybackCommand> {
        let event = self.timer.reset();
        self.react(event, now)
    }

    pub fn tick(&mut self, now: OffsetDateTime) -> Option<PlaybackCommand> {
        let event = self.timer.tick(now);
        if let Some(TimerEvent::Transitioned(t)) = event {
            debug!("Timer transition {:?} (cycle {})", t, self.timer.cycle_index());
        }
        self.react(event, now)
    }

    /// Catch up with the wall clock after the terminal was suspended or lost
    /// focus. The next tick performs any pending transition.
    pub fn resync(&mut self, now: OffsetDateTime) {
        self.timer.resync(now);
        if let Some(deadline) = self.timer.deadline() {
            debug!("Resynced against deadline {}: {}s left", deadline, self.timer.remaining_seconds());
        }
    }

    pub fn apply_preset(&mut self, preset: Preset) {
        self.timer.apply_settings(preset.settings());
        self.message = Some(format!("Preset: {}", preset.name()));
    }

    /// Step one setting by `delta`, never below 1.
    pub fn adjust(&mut self, setting: Setting, delta: i32) {
        let mut settings = self.timer.settings();
        let field = match setting {
            Setting::WorkMinutes => &mut settings.work_minutes,
            Setting::BreakMinutes => &mut settings.break_minutes,
            Setting::Cycles => &mut settings.total_cycles,
        };
        *field = field.saturating_add_signed(delta).max(1);
        self.timer.apply_settings(settings);
    }

    /// Mirror a polled snapshot into the timer. State applied this way is
    /// absorbed by the synchronizer, so no command echoes back.
    pub fn on_playback(
        &mut self,
        snapshot: Option<PlaybackSnapshot>,
        requested_at: OffsetDateTime,
        now: OffsetDateTime,
    ) {
        if !self.logged_in {
            // a poll that was in flight during logout
            return;
        }
        self.loading = false;
        let change = self.sync.reconcile(snapshot.as_ref(), &self.timer, requested_at, now);
        let event = match change {
            Some(ExternalChange::Resume) => self.timer.start(now),
            Some(ExternalChange::Pause) => self.timer.pause(now),
            None => None,
        };
        if let Some(event) = event {
            debug!("Playback changed outside the app: {:?}", event);
            self.sync.absorb(event);
        }
        self.playback = snapshot;
    }

    pub fn on_logged_in(&mut self) {
        self.logged_in = true;
        self.loading = true;
        self.login_url = None;
        self.screen = AppScreen::Timer;
        self.message = Some("Logged in".into());
    }

    /// Drop everything tied to the account and go back to the login screen.
    pub fn on_logged_out(&mut self, message: Option<String>) {
        if let Some(event) = self.timer.reset() {
            self.sync.absorb(event);
        }
        self.logged_in = false;
        self.loading = false;
        self.profile = None;
        self.playback = None;
        self.login_url = None;
        self.screen = AppScreen::Login;
        self.message = message;
    }

    fn react(&mut self, event: Option<TimerEvent>, now: OffsetDateTime) -> Option<PlaybackCommand> {
        let command = self.sync.react(event?, now);
        // without a session there is nobody to send the command to
        command.filter(|_| self.logged_in)
    }
}

/// Map a key press to state changes and the follow-up the loop must run.
pub fn handle_key(app: &mut App, code: KeyCode, now: OffsetDateTime) -> Action {
    if app.screen == AppScreen::Welcome {
        app.leave_welcome();
        return Action::None;
    }
    if matches!(code, KeyCode::Char('q') | KeyCode::Esc) {
        return Action::Quit;
    }

    match app.screen {
        AppScreen::Login => match code {
            KeyCode::Char('l') => Action::Login,
            _ => Action::None,
        },
        AppScreen::Timer => {
            let command = match code {
                KeyCode::Char(' ') | KeyCode::Char('s') => app.toggle_running(now),
                KeyCode::Char('r') => app.reset(now),
                KeyCode::Char('o') => return Action::Logout,
                KeyCode::Char('w') => adjust(app, Setting::WorkMinutes, 1),
                KeyCode::Char('W') => adjust(app, Setting::WorkMinutes, -1),
                KeyCode::Char('b') => adjust(app, Setting::BreakMinutes, 1),
                KeyCode::Char('B') => adjust(app, Setting::BreakMinutes, -1),
                KeyCode::Char('c') => adjust(app, Setting::Cycles, 1),
                KeyCode::Char('C') => adjust(app, Setting::Cycles, -1),
                KeyCode::Char(c) => {
                    if let Some(preset) = Preset::from_key(c) {
                        app.apply_preset(preset);
                    }
                    None
                }
                _ => None,
            };
            command.map_or(Action::None, Action::Playback)
        }
        AppScreen::Welcome => Action::None,
    }
}

fn adjust(app: &mut App, setting: Setting, delta: i32) -> Option<PlaybackCommand> {
    app.adjust(setting, delta);
    None
}
