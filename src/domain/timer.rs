use crate::domain::models::{SessionRecord, SettingsUpdate, TimerMode, TimerSettings};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerField {
    Mode,
    Running,
    Paused,
    Remaining,
    PhaseDuration,
    PhaseEndPending,
    Accumulator,
    Settings,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Idle,
    Running,
    Paused,
}

impl TimerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

/// Running totals for the focus interval and the break that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleAccumulator {
    pub planned_focus_seconds: u64,
    pub planned_break_seconds: u64,
    pub focus_elapsed: Duration,
    pub break_elapsed: Duration,
}

impl CycleAccumulator {
    fn from_settings(settings: &TimerSettings) -> Self {
        Self {
            planned_focus_seconds: settings.focus_seconds,
            planned_break_seconds: settings.break_seconds,
            focus_elapsed: Duration::ZERO,
            break_elapsed: Duration::ZERO,
        }
    }

    fn add(&mut self, mode: TimerMode, delta: Duration) {
        let counter = match mode {
            TimerMode::Focus => &mut self.focus_elapsed,
            TimerMode::Break => &mut self.break_elapsed,
        };
        *counter = counter.saturating_add(delta);
    }

    fn into_record(self, now: DateTime<Utc>) -> SessionRecord {
        SessionRecord::new(now, self.focus_elapsed.as_secs(), self.break_elapsed.as_secs())
    }
}

/// What a single transition did, for observers and for the history commit path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerOutcome {
    pub changed: Vec<TimerField>,
    pub phase_ended: bool,
    pub committed: Option<SessionRecord>,
}

impl TimerOutcome {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && !self.phase_ended && self.committed.is_none()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimerSnapshot {
    pub mode: TimerMode,
    pub status: TimerStatus,
    pub remaining_seconds: f64,
    pub phase_duration_seconds: u64,
    pub progress: f64,
    pub display: String,
    pub overtime: bool,
    pub phase_end_pending: bool,
    pub focus_elapsed_seconds: u64,
    pub break_elapsed_seconds: u64,
}

/// Focus/break countdown state machine. Every transition is total: calling an
/// operation in a state where it does not apply is a no-op, never an error.
#[derive(Debug, Clone)]
pub struct PhaseTimer {
    settings: TimerSettings,
    mode: TimerMode,
    running: bool,
    paused: bool,
    remaining_nanos: i128,
    phase_duration: Duration,
    phase_end_pending: bool,
    accumulator: Option<CycleAccumulator>,
}

impl PhaseTimer {
    pub fn new(settings: TimerSettings) -> Self {
        let phase_duration = settings.duration_for(TimerMode::Focus);
        Self {
            settings,
            mode: TimerMode::Focus,
            running: false,
            paused: false,
            remaining_nanos: duration_nanos(phase_duration),
            phase_duration,
            phase_end_pending: false,
            accumulator: None,
        }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn status(&self) -> TimerStatus {
        if self.running {
            TimerStatus::Running
        } else if self.paused {
            TimerStatus::Paused
        } else {
            TimerStatus::Idle
        }
    }

    pub fn phase_duration(&self) -> Duration {
        self.phase_duration
    }

    pub fn remaining_seconds(&self) -> f64 {
        self.remaining_nanos as f64 / NANOS_PER_SECOND as f64
    }

    pub fn is_overtime(&self) -> bool {
        self.remaining_nanos <= 0
    }

    pub fn phase_end_pending(&self) -> bool {
        self.phase_end_pending
    }

    pub fn accumulator(&self) -> Option<&CycleAccumulator> {
        self.accumulator.as_ref()
    }

    /// Fraction of the phase already elapsed, saturating at 1.0 in overtime.
    pub fn progress(&self) -> f64 {
        if self.remaining_nanos <= 0 {
            return 1.0;
        }
        let total = duration_nanos(self.phase_duration);
        if total == 0 {
            return 1.0;
        }
        (1.0 - self.remaining_nanos as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn display(&self) -> String {
        if self.remaining_nanos > 0 {
            let seconds = (self.remaining_nanos + NANOS_PER_SECOND - 1) / NANOS_PER_SECOND;
            format!("{:02}:{:02}", seconds / 60, seconds % 60)
        } else {
            let seconds = -self.remaining_nanos / NANOS_PER_SECOND;
            format!("+{:02}:{:02}", seconds / 60, seconds % 60)
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let (focus_elapsed, break_elapsed) = self
            .accumulator
            .as_ref()
            .map(|acc| (acc.focus_elapsed.as_secs(), acc.break_elapsed.as_secs()))
            .unwrap_or((0, 0));
        TimerSnapshot {
            mode: self.mode,
            status: self.status(),
            remaining_seconds: self.remaining_seconds(),
            phase_duration_seconds: self.phase_duration.as_secs(),
            progress: self.progress(),
            display: self.display(),
            overtime: self.is_overtime(),
            phase_end_pending: self.phase_end_pending,
            focus_elapsed_seconds: focus_elapsed,
            break_elapsed_seconds: break_elapsed,
        }
    }

    pub fn start(&mut self) -> TimerOutcome {
        let before = self.clone();
        if self.running {
            return TimerOutcome::default();
        }

        if self.paused {
            self.paused = false;
        } else {
            self.load_phase_duration();
        }
        self.running = true;
        self.outcome_since(&before)
    }

    pub fn pause(&mut self) -> TimerOutcome {
        if !self.running {
            return TimerOutcome::default();
        }
        let before = self.clone();
        self.running = false;
        self.paused = true;
        self.outcome_since(&before)
    }

    pub fn reset(&mut self) -> TimerOutcome {
        let before = self.clone();
        self.running = false;
        self.paused = false;
        self.phase_end_pending = false;
        self.load_phase_duration();
        // A break in progress still owns the focus total of its cycle.
        if self.mode == TimerMode::Focus {
            self.accumulator = None;
        }
        self.outcome_since(&before)
    }

    pub fn tick(&mut self, delta: Duration) -> TimerOutcome {
        if !self.running || delta.is_zero() {
            return TimerOutcome::default();
        }
        let before = self.clone();

        let previous = self.remaining_nanos;
        self.remaining_nanos = previous.saturating_sub(duration_nanos(delta));

        let mode = self.mode;
        self.accumulator
            .get_or_insert_with(|| CycleAccumulator::from_settings(&self.settings))
            .add(mode, delta);

        let phase_ended = previous > 0 && self.remaining_nanos <= 0;
        if phase_ended {
            self.phase_end_pending = true;
        }

        let mut outcome = self.outcome_since(&before);
        outcome.phase_ended = phase_ended;
        outcome
    }

    /// Ends the current phase and starts the next one. Leaving a break commits
    /// the finished cycle as a `SessionRecord` stamped with `now`.
    pub fn skip_phase(&mut self, now: DateTime<Utc>) -> TimerOutcome {
        let before = self.clone();
        self.phase_end_pending = false;
        self.running = false;

        let accumulator = self
            .accumulator
            .take()
            .unwrap_or_else(|| CycleAccumulator::from_settings(&self.settings));
        let committed = match self.mode {
            TimerMode::Break => Some(accumulator.into_record(now)),
            TimerMode::Focus => {
                self.accumulator = Some(accumulator);
                None
            }
        };

        self.mode = self.mode.toggled();
        self.load_phase_duration();
        self.running = true;
        self.paused = false;

        let mut outcome = self.outcome_since(&before);
        outcome.committed = committed;
        outcome
    }

    pub fn confirm_phase_end(&mut self, now: DateTime<Utc>) -> TimerOutcome {
        self.skip_phase(now)
    }

    pub fn continue_overtime(&mut self) -> TimerOutcome {
        if !self.phase_end_pending {
            return TimerOutcome::default();
        }
        let before = self.clone();
        self.phase_end_pending = false;
        self.outcome_since(&before)
    }

    /// Stores the valid parts of `update`. An idle timer picks the new length up
    /// immediately; a running or paused countdown keeps its current phase length.
    pub fn apply_settings(&mut self, update: &SettingsUpdate) -> TimerOutcome {
        let before = self.clone();
        self.settings.apply(update);
        if !self.running && !self.paused {
            self.load_phase_duration();
        }
        self.outcome_since(&before)
    }

    fn load_phase_duration(&mut self) {
        self.phase_duration = self.settings.duration_for(self.mode);
        self.remaining_nanos = duration_nanos(self.phase_duration);
    }

    fn outcome_since(&self, before: &PhaseTimer) -> TimerOutcome {
        let mut changed = Vec::new();
        if self.mode != before.mode {
            changed.push(TimerField::Mode);
        }
        if self.running != before.running {
            changed.push(TimerField::Running);
        }
        if self.paused != before.paused {
            changed.push(TimerField::Paused);
        }
        if self.remaining_nanos != before.remaining_nanos {
            changed.push(TimerField::Remaining);
        }
        if self.phase_duration != before.phase_duration {
            changed.push(TimerField::PhaseDuration);
        }
        if self.phase_end_pending != before.phase_end_pending {
            changed.push(TimerField::PhaseEndPending);
        }
        if self.accumulator != before.accumulator {
            changed.push(TimerField::Accumulator);
        }
        if self.settings != before.settings {
            changed.push(TimerField::Settings);
        }
        TimerOutcome {
            changed,
            phase_ended: false,
            committed: None,
        }
    }
}

fn duration_nanos(duration: Duration) -> i128 {
    i128::try_from(duration.as_nanos()).unwrap_or(i128::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn short_settings(focus_seconds: u64, break_seconds: u64) -> TimerSettings {
        TimerSettings {
            focus_seconds,
            break_seconds,
            ..TimerSettings::default()
        }
    }

    fn tick_seconds(timer: &mut PhaseTimer, seconds: u64) {
        for _ in 0..seconds {
            timer.tick(Duration::from_secs(1));
        }
    }

    #[test]
    fn new_timer_is_idle_in_focus_with_full_phase() {
        let timer = PhaseTimer::new(TimerSettings::default());
        assert_eq!(timer.mode(), TimerMode::Focus);
        assert_eq!(timer.status(), TimerStatus::Idle);
        assert_eq!(timer.remaining_seconds(), 1500.0);
        assert_eq!(timer.display(), "25:00");
        assert_eq!(timer.progress(), 0.0);
    }

    #[test]
    fn start_is_noop_while_running() {
        let mut timer = PhaseTimer::new(short_settings(60, 30));
        let started = timer.start();
        assert!(started.changed.contains(&TimerField::Running));
        timer.tick(Duration::from_secs(5));

        let again = timer.start();
        assert!(again.is_noop());
        assert_eq!(timer.remaining_seconds(), 55.0);
    }

    #[test]
    fn pause_then_start_resumes_without_resetting_duration() {
        let mut timer = PhaseTimer::new(short_settings(60, 30));
        timer.start();
        timer.tick(Duration::from_secs(10));
        timer.pause();
        assert_eq!(timer.status(), TimerStatus::Paused);

        assert!(timer.tick(Duration::from_secs(10)).is_noop());
        assert_eq!(timer.remaining_seconds(), 50.0);

        let resumed = timer.start();
        assert!(resumed.changed.contains(&TimerField::Paused));
        assert!(!resumed.changed.contains(&TimerField::Remaining));
        assert_eq!(timer.status(), TimerStatus::Running);
        assert_eq!(timer.remaining_seconds(), 50.0);
    }

    #[test]
    fn pause_is_noop_when_idle() {
        let mut timer = PhaseTimer::new(TimerSettings::default());
        assert!(timer.pause().is_noop());
        assert_eq!(timer.status(), TimerStatus::Idle);
    }

    #[test]
    fn ticks_cross_zero_exactly_once_at_tick_300() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();

        let mut fired_at = Vec::new();
        for index in 1..=300 {
            if timer.tick(Duration::from_millis(100)).phase_ended {
                fired_at.push(index);
            }
        }
        assert_eq!(fired_at, vec![300]);
        assert!(timer.phase_end_pending());
        assert_eq!(timer.display(), "+00:00");

        for _ in 0..50 {
            assert!(!timer.tick(Duration::from_millis(100)).phase_ended);
        }
        assert_eq!(timer.display(), "+00:05");
    }

    #[test]
    fn continue_overtime_clears_signal_without_switching() {
        let mut timer = PhaseTimer::new(short_settings(2, 1));
        timer.start();
        tick_seconds(&mut timer, 3);
        assert!(timer.phase_end_pending());

        let outcome = timer.continue_overtime();
        assert_eq!(outcome.changed, vec![TimerField::PhaseEndPending]);
        assert_eq!(timer.mode(), TimerMode::Focus);
        assert!(timer.is_running());

        tick_seconds(&mut timer, 2);
        assert!(!timer.phase_end_pending());
        assert_eq!(timer.remaining_seconds(), -3.0);
        assert!(timer.continue_overtime().is_noop());
    }

    #[test]
    fn progress_saturates_in_overtime() {
        let mut timer = PhaseTimer::new(short_settings(4, 1));
        timer.start();
        timer.tick(Duration::from_secs(1));
        assert_eq!(timer.progress(), 0.25);
        tick_seconds(&mut timer, 3);
        assert_eq!(timer.progress(), 1.0);
        tick_seconds(&mut timer, 10);
        assert_eq!(timer.progress(), 1.0);
    }

    #[test]
    fn full_cycle_commits_single_record_with_tick_sums() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();
        tick_seconds(&mut timer, 32);

        let focus_done = timer.skip_phase(fixed_time("2026-02-16T10:00:00Z"));
        assert!(focus_done.committed.is_none());
        assert_eq!(timer.mode(), TimerMode::Break);
        assert!(timer.is_running());
        assert_eq!(timer.remaining_seconds(), 10.0);

        tick_seconds(&mut timer, 7);
        let break_done = timer.confirm_phase_end(fixed_time("2026-02-16T10:05:00Z"));
        let record = break_done.committed.expect("break end commits");
        assert_eq!(record.focus_seconds, 32);
        assert_eq!(record.break_seconds, 7);
        assert_eq!(record.timestamp, fixed_time("2026-02-16T10:05:00Z"));
        assert!(timer.accumulator().is_none());
        assert_eq!(timer.mode(), TimerMode::Focus);
    }

    #[test]
    fn skipping_focus_alone_commits_nothing() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();
        tick_seconds(&mut timer, 5);
        let outcome = timer.skip_phase(fixed_time("2026-02-16T10:00:00Z"));
        assert!(outcome.committed.is_none());
        assert_eq!(
            timer.accumulator().map(|acc| acc.focus_elapsed),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn skipping_without_ticks_still_produces_a_record() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.skip_phase(fixed_time("2026-02-16T10:00:00Z"));
        let accumulator = timer.accumulator().expect("initialized on skip");
        assert_eq!(accumulator.planned_focus_seconds, 30);
        assert_eq!(accumulator.planned_break_seconds, 10);

        let outcome = timer.skip_phase(fixed_time("2026-02-16T10:00:01Z"));
        let record = outcome.committed.expect("record");
        assert_eq!((record.focus_seconds, record.break_seconds), (0, 0));
    }

    #[test]
    fn sub_second_ticks_are_not_dropped_before_commit() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();
        for _ in 0..25 {
            timer.tick(Duration::from_millis(40));
        }
        timer.skip_phase(fixed_time("2026-02-16T10:00:00Z"));
        for _ in 0..3 {
            timer.tick(Duration::from_millis(350));
        }
        let record = timer
            .skip_phase(fixed_time("2026-02-16T10:01:00Z"))
            .committed
            .expect("record");
        assert_eq!(record.focus_seconds, 1);
        assert_eq!(record.break_seconds, 1);
    }

    #[test]
    fn reset_in_focus_discards_accumulator() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();
        tick_seconds(&mut timer, 4);
        let outcome = timer.reset();
        assert!(outcome.changed.contains(&TimerField::Accumulator));
        assert!(timer.accumulator().is_none());
        assert_eq!(timer.status(), TimerStatus::Idle);
        assert_eq!(timer.remaining_seconds(), 30.0);
    }

    #[test]
    fn reset_in_break_keeps_focus_total() {
        let mut timer = PhaseTimer::new(short_settings(30, 10));
        timer.start();
        tick_seconds(&mut timer, 12);
        timer.skip_phase(fixed_time("2026-02-16T10:00:00Z"));
        tick_seconds(&mut timer, 3);

        timer.reset();
        assert_eq!(timer.mode(), TimerMode::Break);
        assert_eq!(timer.remaining_seconds(), 10.0);
        assert_eq!(
            timer.accumulator().map(|acc| acc.focus_elapsed),
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn settings_change_applies_only_while_idle() {
        let mut timer = PhaseTimer::new(TimerSettings::default());
        let outcome = timer.apply_settings(&SettingsUpdate {
            focus_minutes: Some(50),
            break_minutes: None,
        });
        assert!(outcome.changed.contains(&TimerField::Remaining));
        assert_eq!(timer.remaining_seconds(), 3000.0);

        timer.start();
        timer.tick(Duration::from_secs(1));
        timer.apply_settings(&SettingsUpdate {
            focus_minutes: Some(10),
            break_minutes: Some(0),
        });
        assert_eq!(timer.remaining_seconds(), 2999.0);
        assert_eq!(timer.settings().focus_seconds, 600);
        assert_eq!(timer.settings().break_seconds, 300);

        timer.reset();
        assert_eq!(timer.remaining_seconds(), 600.0);
    }

    proptest! {
        #[test]
        fn remaining_depends_only_on_tick_sum(total_ms in 1u64..120_000u64, pieces in 1u64..64u64) {
            let settings = short_settings(60, 30);
            let mut single = PhaseTimer::new(settings.clone());
            single.start();
            single.tick(Duration::from_millis(total_ms));

            let mut split = PhaseTimer::new(settings);
            split.start();
            let piece = total_ms / pieces;
            for _ in 0..pieces - 1 {
                split.tick(Duration::from_millis(piece));
            }
            split.tick(Duration::from_millis(total_ms - piece * (pieces - 1)));

            let expected = 60.0 - total_ms as f64 / 1000.0;
            prop_assert!((single.remaining_seconds() - expected).abs() < 1e-9);
            prop_assert!((split.remaining_seconds() - expected).abs() < 1e-9);
        }

        #[test]
        fn progress_is_monotone_and_phase_end_fires_once(
            deltas in proptest::collection::vec(1u64..2_000u64, 1..200)
        ) {
            let mut timer = PhaseTimer::new(short_settings(30, 10));
            timer.start();
            let mut last_progress = timer.progress();
            let mut fired = 0;
            for delta in deltas {
                if timer.tick(Duration::from_millis(delta)).phase_ended {
                    fired += 1;
                }
                let progress = timer.progress();
                prop_assert!(progress >= last_progress);
                prop_assert!(progress <= 1.0);
                if timer.is_overtime() {
                    prop_assert_eq!(progress, 1.0);
                }
                last_progress = progress;
            }
            prop_assert_eq!(fired, if timer.is_overtime() { 1 } else { 0 });
        }

        #[test]
        fn committed_record_matches_tick_sums(focus in 0u64..200u64, rest in 0u64..200u64) {
            let mut timer = PhaseTimer::new(short_settings(60, 30));
            timer.start();
            tick_seconds(&mut timer, focus);
            prop_assert!(timer.skip_phase(Utc::now()).committed.is_none());
            tick_seconds(&mut timer, rest);
            let record = timer.skip_phase(Utc::now()).committed.expect("record");
            prop_assert_eq!(record.focus_seconds, focus);
            prop_assert_eq!(record.break_seconds, rest);
        }
    }
}
