//! Deadline-based Pomodoro countdown.
//!
//! The timer never decrements a counter per tick. While running it keeps an
//! absolute wall-clock deadline and derives the remaining seconds from it, so
//! delayed or missed ticks (terminal suspended, laptop asleep) cannot skew it.
//! Every mutating operation takes `now` explicitly and returns the
//! [`TimerEvent`] it caused, if any; the timer knows nothing about playback.

use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Work,
    Break,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Work => "Work",
            Phase::Break => "Break",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub total_cycles: u32,
}

impl TimerSettings {
    pub fn work_seconds(&self) -> u64 {
        u64::from(self.work_minutes) * 60
    }

    pub fn break_seconds(&self) -> u64 {
        u64::from(self.break_minutes) * 60
    }

    pub fn phase_seconds(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Work => self.work_seconds(),
            Phase::Break => self.break_seconds(),
        }
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self { work_minutes: 25, break_minutes: 5, total_cycles: 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WorkToBreak,
    WorkToComplete,
    BreakToWork,
}

/// What a timer operation did, for whoever couples the timer to playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Started { phase: Phase },
    Paused { phase: Phase },
    Reset,
    Transitioned(Transition),
}

#[derive(Debug, Clone)]
pub struct PomodoroTimer {
    settings: TimerSettings,
    phase: Phase,
    cycle_index: u32,
    remaining_seconds: u64,
    running: bool,
    complete: bool,
    deadline: Option<OffsetDateTime>,
}

impl PomodoroTimer {
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings,
            phase: Phase::Work,
            cycle_index: 0,
            remaining_seconds: settings.work_seconds(),
            running: false,
            complete: false,
            deadline: None,
        }
    }

    pub fn settings(&self) -> TimerSettings {
        self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycle_index(&self) -> u32 {
        self.cycle_index
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.remaining_seconds
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn deadline(&self) -> Option<OffsetDateTime> {
        self.deadline
    }

    /// Fraction of the current phase already elapsed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.complete {
            return 1.0;
        }
        let total = self.settings.phase_seconds(self.phase);
        if total == 0 {
            return 1.0;
        }
        let left = self.remaining_seconds.min(total);
        (total - left) as f64 / total as f64
    }

    /// Start or resume. Starting a completed timer restarts it from the first
    /// work phase.
    pub fn start(&mut self, now: OffsetDateTime) -> Option<TimerEvent> {
        if self.running {
            return None;
        }
        if self.complete {
            self.reset();
        }
        self.deadline = Some(now + seconds(self.remaining_seconds));
        self.running = true;
        Some(TimerEvent::Started { phase: self.phase })
    }

    pub fn pause(&mut self, now: OffsetDateTime) -> Option<TimerEvent> {
        if !self.running {
            return None;
        }
        if let Some(deadline) = self.deadline.take() {
            self.remaining_seconds = ceil_seconds(deadline - now);
        }
        self.running = false;
        Some(TimerEvent::Paused { phase: self.phase })
    }

    pub fn reset(&mut self) -> Option<TimerEvent> {
        self.phase = Phase::Work;
        self.cycle_index = 0;
        self.remaining_seconds = self.settings.work_seconds();
        self.running = false;
        self.complete = false;
        self.deadline = None;
        Some(TimerEvent::Reset)
    }

    /// Advance to `now`. Returns a transition event when the deadline passed.
    pub fn tick(&mut self, now: OffsetDateTime) -> Option<TimerEvent> {
        if !self.running {
            return None;
        }
        let deadline = self.deadline?;
        if now >= deadline {
            return Some(TimerEvent::Transitioned(self.transition(now)));
        }
        self.remaining_seconds = ceil_seconds(deadline - now);
        None
    }

    /// Recompute the remaining time from the deadline after the host was
    /// suspended or hidden. Never transitions by itself.
    pub fn resync(&mut self, now: OffsetDateTime) {
        if let (true, Some(deadline)) = (self.running, self.deadline) {
            self.remaining_seconds = ceil_seconds(deadline - now);
        }
    }

    fn transition(&mut self, now: OffsetDateTime) -> Transition {
        match self.phase {
            Phase::Work if self.cycle_index + 1 >= self.settings.total_cycles => {
                self.running = false;
                self.complete = true;
                self.remaining_seconds = 0;
                self.deadline = None;
                Transition::WorkToComplete
            }
            Phase::Work => {
                self.phase = Phase::Break;
                self.cycle_index += 1;
                self.enter_phase(now);
                Transition::WorkToBreak
            }
            Phase::Break => {
                self.phase = Phase::Work;
                self.enter_phase(now);
                Transition::BreakToWork
            }
        }
    }

    fn enter_phase(&mut self, now: OffsetDateTime) {
        self.remaining_seconds = self.settings.phase_seconds(self.phase);
        self.deadline = Some(now + seconds(self.remaining_seconds));
    }

    /// Apply new settings. The visible countdown only changes when the timer
    /// is stopped and the changed length belongs to the current phase;
    /// otherwise the new length is used on the next phase entry.
    /// Cycles never drop below the ones already started, so the cycle index
    /// stays inside `[0, total_cycles)`.
    pub fn apply_settings(&mut self, mut settings: TimerSettings) {
        settings.total_cycles = settings.total_cycles.max(self.cycle_index + 1);
        let old = self.settings;
        self.settings = settings;
        if self.running || self.complete {
            return;
        }
        let changed = match self.phase {
            Phase::Work => old.work_minutes != settings.work_minutes,
            Phase::Break => old.break_minutes != settings.break_minutes,
        };
        if changed {
            self.remaining_seconds = settings.phase_seconds(self.phase);
        }
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Whole seconds left, rounded up and clamped at zero.
fn ceil_seconds(left: Duration) -> u64 {
    let ms = left.whole_milliseconds();
    if ms <= 0 {
        return 0;
    }
    u64::try_from((ms + 999) / 1000).unwrap_or(u64::MAX)
}
