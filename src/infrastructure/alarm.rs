use crate::domain::models::TimerMode;
use log::info;
use std::io::Write;

/// Receives each repetition of the phase-end alarm. `repetition` is 1-based.
pub trait AlarmSink: Send + Sync {
    fn ring(&self, mode: TimerMode, repetition: u8);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlarmSink;

impl AlarmSink for LogAlarmSink {
    fn ring(&self, mode: TimerMode, repetition: u8) {
        info!("{} phase ended (alarm {repetition})", mode.as_str());
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAlarmSink;

impl AlarmSink for NoopAlarmSink {
    fn ring(&self, _mode: TimerMode, _repetition: u8) {}
}
