use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_FOCUS_MINUTES: u32 = 25;
pub const DEFAULT_BREAK_MINUTES: u32 = 5;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const MAX_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One completed focus interval together with the break that followed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub focus_seconds: u64,
    pub break_seconds: u64,
}

impl SessionRecord {
    pub fn new(timestamp: DateTime<Utc>, focus_seconds: u64, break_seconds: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            focus_seconds,
            break_seconds,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    Focus,
    Break,
}

impl TimerMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Focus => Self::Break,
            Self::Break => Self::Focus,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Break => "break",
        }
    }
}

/// Phase lengths are kept in seconds; the settings store speaks minutes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    pub focus_seconds: u64,
    pub break_seconds: u64,
    pub tick_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_FOCUS_MINUTES, DEFAULT_BREAK_MINUTES)
    }
}

impl TimerSettings {
    pub fn from_minutes(focus_minutes: u32, break_minutes: u32) -> Self {
        Self {
            focus_seconds: u64::from(focus_minutes) * 60,
            break_seconds: u64::from(break_minutes) * 60,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn focus_minutes(&self) -> u64 {
        self.focus_seconds / 60
    }

    pub fn break_minutes(&self) -> u64 {
        self.break_seconds / 60
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.focus_seconds == 0 {
            return Err("settings.focus_seconds must be > 0".to_string());
        }
        if self.break_seconds == 0 {
            return Err("settings.break_seconds must be > 0".to_string());
        }
        if self.tick_interval.is_zero() || self.tick_interval > MAX_TICK_INTERVAL {
            return Err("settings.tick_interval must be within (0s, 1s]".to_string());
        }
        Ok(())
    }

    pub fn duration_for(&self, mode: TimerMode) -> Duration {
        match mode {
            TimerMode::Focus => Duration::from_secs(self.focus_seconds),
            TimerMode::Break => Duration::from_secs(self.break_seconds),
        }
    }

    /// Applies the positive values of `update`; anything else keeps the current value.
    /// Returns whether a duration actually changed.
    pub fn apply(&mut self, update: &SettingsUpdate) -> bool {
        let mut changed = false;
        if let Some(seconds) = update.focus_minutes.and_then(positive_minutes_as_seconds) {
            changed |= self.focus_seconds != seconds;
            self.focus_seconds = seconds;
        }
        if let Some(seconds) = update.break_minutes.and_then(positive_minutes_as_seconds) {
            changed |= self.break_seconds != seconds;
            self.break_seconds = seconds;
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub focus_minutes: Option<i64>,
    pub break_minutes: Option<i64>,
}

fn positive_minutes_as_seconds(value: i64) -> Option<u64> {
    if value <= 0 {
        return None;
    }
    u64::try_from(value).ok()?.checked_mul(60)
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
