//! Couples timer events to play/pause commands and mirrors external playback
//! changes back into the timer.
//!
//! The synchronizer only decides; it never performs I/O. The caller issues
//! the returned [`PlaybackCommand`] and applies the returned
//! [`ExternalChange`] to the timer.

use time::{Duration, OffsetDateTime};

use crate::model::PlaybackSnapshot;
use crate::timer::{Phase, PomodoroTimer, TimerEvent, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Play,
    Pause,
}

impl PlaybackCommand {
    fn for_state(phase: Phase, running: bool) -> Self {
        if phase == Phase::Work && running {
            PlaybackCommand::Play
        } else {
            PlaybackCommand::Pause
        }
    }
}

/// What an observed snapshot asks the timer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalChange {
    Resume,
    Pause,
}

#[derive(Debug)]
pub struct Synchronizer {
    guard_window: Duration,
    last_state: (Phase, bool),
    last_command_at: Option<OffsetDateTime>,
}

impl Synchronizer {
    pub fn new(guard_window: std::time::Duration) -> Self {
        Self {
            guard_window: Duration::try_from(guard_window).unwrap_or(Duration::SECOND),
            last_state: (Phase::Work, false),
            last_command_at: None,
        }
    }

    /// React to a timer event. Returns the command to issue, if any, and
    /// opens the guard window when it does.
    pub fn react(&mut self, event: TimerEvent, now: OffsetDateTime) -> Option<PlaybackCommand> {
        let command = match event {
            TimerEvent::Transitioned(t) => {
                self.last_state = state_after(event);
                Some(match t {
                    Transition::WorkToBreak | Transition::WorkToComplete => PlaybackCommand::Pause,
                    Transition::BreakToWork => PlaybackCommand::Play,
                })
            }
            other => {
                let state = state_after(other);
                if state == self.last_state {
                    None
                } else {
                    self.last_state = state;
                    Some(PlaybackCommand::for_state(state.0, state.1))
                }
            }
        };
        if command.is_some() {
            self.last_command_at = Some(now);
        }
        command
    }

    /// Record a timer event without issuing a command, used when the event
    /// itself came from mirroring the remote player.
    pub fn absorb(&mut self, event: TimerEvent) {
        self.last_state = state_after(event);
    }

    fn predates_command(&self, requested_at: OffsetDateTime) -> bool {
        self.last_command_at.is_some_and(|at| requested_at <= at)
    }

    pub fn in_guard_window(&self, now: OffsetDateTime) -> bool {
        self.last_command_at
            .is_some_and(|at| now < at + self.guard_window)
    }

    /// Decide whether a polled snapshot should move the timer. Only a work
    /// phase of an unfinished timer mirrors the remote player, and never
    /// inside the guard window after our own command. A snapshot requested
    /// before our last command describes the player before it and is stale.
    pub fn reconcile(
        &self,
        snapshot: Option<&PlaybackSnapshot>,
        timer: &PomodoroTimer,
        requested_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Option<ExternalChange> {
        let snapshot = snapshot?;
        snapshot.device.as_ref()?;
        if self.in_guard_window(now) || self.predates_command(requested_at) {
            return None;
        }
        if timer.is_complete() || timer.phase() != Phase::Work {
            return None;
        }
        match (snapshot.is_playing, timer.is_running()) {
            (true, false) => Some(ExternalChange::Resume),
            (false, true) => Some(ExternalChange::Pause),
            _ => None,
        }
    }
}

fn state_after(event: TimerEvent) -> (Phase, bool) {
    match event {
        TimerEvent::Started { phase } => (phase, true),
        TimerEvent::Paused { phase } => (phase, false),
        TimerEvent::Reset => (Phase::Work, false),
        TimerEvent::Transitioned(Transition::WorkToBreak) => (Phase::Break, true),
        TimerEvent::Transitioned(Transition::WorkToComplete) => (Phase::Work, false),
        TimerEvent::Transitioned(Transition::BreakToWork) => (Phase::Work, true),
    }
}
