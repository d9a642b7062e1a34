use crate::application::history_ledger::{HistoryLedger, run_blocking};
use crate::domain::models::{SessionRecord, SettingsUpdate, TimerMode, TimerSettings};
use crate::domain::timer::{PhaseTimer, TimerField, TimerOutcome, TimerSnapshot};
use crate::infrastructure::alarm::AlarmSink;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_repository::HistoryRepository;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const ALARM_OFFSETS_MS: [u64; 3] = [0, 800, 1600];
const EVENT_CAPACITY: usize = 64;

/// Published to subscribers after every transition that changed something.
#[derive(Debug, Clone, Serialize)]
pub struct TimerEvent {
    pub changed: Vec<TimerField>,
    pub phase_ended: bool,
    pub committed: Option<SessionRecord>,
    pub snapshot: TimerSnapshot,
}

/// The three alarm repetitions for one phase end, cancelled together.
#[derive(Debug, Default)]
pub struct AlarmSchedule {
    handle: Option<JoinHandle<()>>,
}

impl AlarmSchedule {
    pub fn schedule<A>(&mut self, sink: Arc<A>, mode: TimerMode)
    where
        A: AlarmSink + ?Sized + 'static,
    {
        self.cancel();
        let started = Instant::now();
        self.handle = Some(tokio::spawn(async move {
            for (index, offset) in ALARM_OFFSETS_MS.iter().enumerate() {
                time::sleep_until(started + Duration::from_millis(*offset)).await;
                sink.ring(mode, index as u8 + 1);
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AlarmSchedule {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Countdown state, the instant it was last advanced to, and the ticker task.
/// Kept under one lock so a transition and the ticker never interleave.
struct TimerCore {
    timer: PhaseTimer,
    last_tick: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
}

impl TimerCore {
    /// Credits the time since the last advance to the current phase.
    fn advance_to(&mut self, now: Instant) -> Option<(TimerOutcome, TimerSnapshot)> {
        if !self.timer.is_running() {
            self.last_tick = None;
            return None;
        }
        let last = self.last_tick.replace(now)?;
        let outcome = self.timer.tick(now.saturating_duration_since(last));
        if outcome.is_noop() {
            return None;
        }
        Some((outcome, self.timer.snapshot()))
    }
}

pub struct TimerService<R, A>
where
    R: HistoryRepository + 'static,
    A: AlarmSink + ?Sized + 'static,
{
    core: Arc<Mutex<TimerCore>>,
    ledger: Arc<HistoryLedger<R>>,
    alarm_sink: Arc<A>,
    alarm: Arc<StdMutex<AlarmSchedule>>,
    pending_commits: Arc<StdMutex<Vec<SessionRecord>>>,
    flush_lock: Arc<Mutex<()>>,
    events: broadcast::Sender<TimerEvent>,
    now_provider: NowProvider,
}

impl<R, A> Clone for TimerService<R, A>
where
    R: HistoryRepository + 'static,
    A: AlarmSink + ?Sized + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            ledger: Arc::clone(&self.ledger),
            alarm_sink: Arc::clone(&self.alarm_sink),
            alarm: Arc::clone(&self.alarm),
            pending_commits: Arc::clone(&self.pending_commits),
            flush_lock: Arc::clone(&self.flush_lock),
            events: self.events.clone(),
            now_provider: Arc::clone(&self.now_provider),
        }
    }
}

impl<R, A> TimerService<R, A>
where
    R: HistoryRepository + 'static,
    A: AlarmSink + ?Sized + 'static,
{
    pub fn new(settings: TimerSettings, ledger: Arc<HistoryLedger<R>>, alarm_sink: Arc<A>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(Mutex::new(TimerCore {
                timer: PhaseTimer::new(settings),
                last_tick: None,
                ticker: None,
            })),
            ledger,
            alarm_sink,
            alarm: Arc::new(StdMutex::new(AlarmSchedule::default())),
            pending_commits: Arc::new(StdMutex::new(Vec::new())),
            flush_lock: Arc::new(Mutex::new(())),
            events,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        self.core.lock().await.timer.snapshot()
    }

    pub async fn start(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, _| timer.start()).await
    }

    pub async fn pause(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, _| timer.pause()).await
    }

    pub async fn reset(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, _| timer.reset()).await
    }

    pub async fn skip_phase(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, now| timer.skip_phase(now)).await
    }

    pub async fn confirm_phase_end(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, now| timer.confirm_phase_end(now)).await
    }

    pub async fn continue_overtime(&self) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, _| timer.continue_overtime()).await
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<TimerEvent, InfraError> {
        self.transition(|timer, _| timer.apply_settings(&update)).await
    }

    /// Stops the ticker and the alarm, then makes a last attempt at saving any
    /// session whose earlier write failed.
    pub async fn shutdown(&self) {
        {
            let mut core = self.core.lock().await;
            core.last_tick = None;
            if let Some(handle) = core.ticker.take() {
                handle.abort();
            }
        }
        if let Ok(mut alarm) = self.alarm.lock() {
            alarm.cancel();
        }
        if let Err(flush_error) = self.flush_pending_commits().await {
            error!("sessions left unsaved at shutdown: {flush_error}");
        }
    }

    pub fn alarm_active(&self) -> bool {
        self.alarm.lock().map(|alarm| alarm.is_active()).unwrap_or(false)
    }

    async fn transition<F>(&self, apply: F) -> Result<TimerEvent, InfraError>
    where
        F: FnOnce(&mut PhaseTimer, DateTime<Utc>) -> TimerOutcome,
    {
        let now = (self.now_provider)();
        let event = {
            let mut core = self.core.lock().await;
            if let Some((outcome, snapshot)) = core.advance_to(Instant::now()) {
                self.publish(outcome, snapshot);
            }
            let outcome = apply(&mut core.timer, now);
            let snapshot = core.timer.snapshot();
            self.sync_ticker(&mut core);
            self.publish(outcome, snapshot)
        };

        if event.committed.is_some() {
            self.flush_pending_commits().await?;
        }
        Ok(event)
    }

    /// Arms the alarm, queues any committed record and notifies subscribers.
    /// Runs under the core lock so events go out in transition order.
    fn publish(&self, outcome: TimerOutcome, snapshot: TimerSnapshot) -> TimerEvent {
        if let Ok(mut alarm) = self.alarm.lock() {
            if outcome.phase_ended {
                alarm.schedule(Arc::clone(&self.alarm_sink), snapshot.mode);
            } else if outcome.changed.contains(&TimerField::PhaseEndPending)
                && !snapshot.phase_end_pending
            {
                alarm.cancel();
            }
        }

        if let Some(record) = &outcome.committed {
            info!(
                "committed session {} (focus {}s, break {}s)",
                record.id, record.focus_seconds, record.break_seconds
            );
            match self.pending_commits.lock() {
                Ok(mut pending) => pending.push(record.clone()),
                Err(lock_error) => error!("session {} dropped: {lock_error}", record.id),
            }
        }

        let noop = outcome.is_noop();
        let event = TimerEvent {
            changed: outcome.changed,
            phase_ended: outcome.phase_ended,
            committed: outcome.committed,
            snapshot,
        };
        if !noop {
            let _ = self.events.send(event.clone());
        }
        event
    }

    /// Writes queued sessions to the ledger. A failed batch goes back to the
    /// front of the queue and is retried with the next commit or at shutdown.
    async fn flush_pending_commits(&self) -> Result<(), InfraError> {
        let _flush = self.flush_lock.lock().await;
        let batch = match self.pending_commits.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(lock_error) => {
                return Err(InfraError::InvalidConfig(format!(
                    "pending sessions lock poisoned: {lock_error}"
                )));
            }
        };
        if batch.is_empty() {
            return Ok(());
        }

        let ledger = Arc::clone(&self.ledger);
        let retry = batch.clone();
        match run_blocking(move || ledger.prepend_all(batch)).await {
            Ok(()) => Ok(()),
            Err(write_error) => {
                warn!(
                    "keeping {} unsaved session(s) for retry: {write_error}",
                    retry.len()
                );
                if let Ok(mut pending) = self.pending_commits.lock() {
                    let newer = std::mem::replace(&mut *pending, retry);
                    pending.extend(newer);
                }
                Err(write_error)
            }
        }
    }

    /// Matches the ticker task to the running flag. Called with the core held.
    fn sync_ticker(&self, core: &mut TimerCore) {
        if !core.timer.is_running() {
            core.last_tick = None;
            if let Some(handle) = core.ticker.take() {
                handle.abort();
            }
            return;
        }

        if core.last_tick.is_none() {
            core.last_tick = Some(Instant::now());
        }
        if core.ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let tick_interval = core.timer.settings().tick_interval;
        let service = self.clone();
        core.ticker = Some(tokio::spawn(service.run_ticker(tick_interval)));
    }

    async fn run_ticker(self, tick_interval: Duration) {
        let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let mut core = self.core.lock().await;
            if !core.timer.is_running() {
                core.last_tick = None;
                break;
            }
            if let Some((outcome, snapshot)) = core.advance_to(Instant::now()) {
                self.publish(outcome, snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timer::TimerStatus;
    use crate::infrastructure::alarm::NoopAlarmSink;
    use crate::infrastructure::history_repository::InMemoryHistoryRepository;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingAlarmSink {
        rings: StdMutex<Vec<(TimerMode, u8)>>,
    }

    impl AlarmSink for RecordingAlarmSink {
        fn ring(&self, mode: TimerMode, repetition: u8) {
            self.rings
                .lock()
                .expect("rings lock")
                .push((mode, repetition));
        }
    }

    #[derive(Default)]
    struct FlakyHistoryRepository {
        inner: InMemoryHistoryRepository,
        fail: AtomicBool,
    }

    impl HistoryRepository for FlakyHistoryRepository {
        fn load(&self) -> Result<Vec<SessionRecord>, InfraError> {
            self.inner.load()
        }

        fn save(&self, records: &[SessionRecord]) -> Result<(), InfraError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(InfraError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(records)
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn short_settings() -> TimerSettings {
        TimerSettings {
            focus_seconds: 2,
            break_seconds: 1,
            tick_interval: Duration::from_millis(100),
        }
    }

    fn service_over<R, A>(repository: Arc<R>, sink: Arc<A>) -> (TimerService<R, A>, Arc<HistoryLedger<R>>)
    where
        R: HistoryRepository + 'static,
        A: AlarmSink + 'static,
    {
        let ledger = Arc::new(HistoryLedger::new(repository));
        let service = TimerService::new(short_settings(), Arc::clone(&ledger), sink)
            .with_now_provider(Arc::new(|| fixed_time("2026-02-16T10:00:00Z")));
        (service, ledger)
    }

    fn service_with<A>(
        sink: Arc<A>,
    ) -> (TimerService<InMemoryHistoryRepository, A>, Arc<HistoryLedger<InMemoryHistoryRepository>>)
    where
        A: AlarmSink + 'static,
    {
        service_over(Arc::new(InMemoryHistoryRepository::default()), sink)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_commits_one_record_to_ledger() {
        let (service, ledger) = service_with(Arc::new(NoopAlarmSink));

        service.start().await.expect("start");
        time::sleep(Duration::from_millis(2_050)).await;
        assert!(service.snapshot().await.phase_end_pending);

        let switched = service.confirm_phase_end().await.expect("confirm focus");
        assert_eq!(switched.snapshot.mode, TimerMode::Break);
        assert!(switched.committed.is_none());

        time::sleep(Duration::from_millis(1_050)).await;
        let committed = service.confirm_phase_end().await.expect("confirm break");
        let record = committed.committed.expect("record committed");
        assert_eq!(record.focus_seconds, 2);
        assert_eq!(record.break_seconds, 1);
        assert_eq!(record.timestamp, fixed_time("2026-02-16T10:00:00Z"));

        let stored = ledger.records().expect("records");
        assert_eq!(stored, vec![record]);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn skipping_focus_alone_commits_nothing() {
        let (service, ledger) = service_with(Arc::new(NoopAlarmSink));
        service.start().await.expect("start");
        let event = service.skip_phase().await.expect("skip");

        assert!(event.committed.is_none());
        assert_eq!(event.snapshot.mode, TimerMode::Break);
        assert!(ledger.records().expect("records").is_empty());
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn skip_credits_elapsed_time_to_the_phase_it_leaves() {
        let (service, _) = service_with(Arc::new(NoopAlarmSink));
        service.start().await.expect("start");
        time::sleep(Duration::from_millis(1_150)).await;

        let skipped = service.skip_phase().await.expect("skip");
        assert_eq!(skipped.snapshot.focus_elapsed_seconds, 1);
        assert_close(skipped.snapshot.remaining_seconds, 1.0);

        time::sleep(Duration::from_millis(60)).await;
        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.mode, TimerMode::Break);
        assert_close(snapshot.remaining_seconds, 0.95);
        assert_eq!(snapshot.break_elapsed_seconds, 0);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn phase_end_rings_alarm_three_times() {
        let sink = Arc::new(RecordingAlarmSink::default());
        let (service, _) = service_with(Arc::clone(&sink));

        service.start().await.expect("start");
        time::sleep(Duration::from_millis(2_050)).await;
        service.pause().await.expect("pause");
        assert!(service.alarm_active());

        time::sleep(Duration::from_secs(2)).await;
        let rings = sink.rings.lock().expect("rings lock").clone();
        assert_eq!(
            rings,
            vec![
                (TimerMode::Focus, 1),
                (TimerMode::Focus, 2),
                (TimerMode::Focus, 3)
            ]
        );
        assert!(!service.alarm_active());
    }

    #[tokio::test(start_paused = true)]
    async fn continuing_overtime_cancels_pending_alarm() {
        let sink = Arc::new(RecordingAlarmSink::default());
        let (service, _) = service_with(Arc::clone(&sink));

        service.start().await.expect("start");
        time::sleep(Duration::from_millis(2_050)).await;
        service.continue_overtime().await.expect("continue");
        service.pause().await.expect("pause");

        time::sleep(Duration::from_secs(2)).await;
        assert!(sink.rings.lock().expect("rings lock").len() < 3);
        assert!(!service.alarm_active());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_drives_countdown_and_publishes_phase_end() {
        let (service, _) = service_with(Arc::new(NoopAlarmSink));
        let mut events = service.subscribe();

        service.start().await.expect("start");
        time::sleep(Duration::from_millis(2_050)).await;

        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.status, TimerStatus::Running);
        assert!(snapshot.phase_end_pending);
        assert!(snapshot.overtime);

        let mut phase_end_events = 0;
        while let Ok(event) = events.try_recv() {
            if event.phase_ended {
                phase_end_events += 1;
            }
        }
        assert_eq!(phase_end_events, 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_keeps_time_since_the_last_tick() {
        let (service, _) = service_with(Arc::new(NoopAlarmSink));
        service.start().await.expect("start");
        time::sleep(Duration::from_millis(550)).await;

        let paused = service.pause().await.expect("pause");
        assert_close(paused.snapshot.remaining_seconds, 1.45);

        time::sleep(Duration::from_secs(1)).await;
        let snapshot = service.snapshot().await;
        assert_close(snapshot.remaining_seconds, 1.45);
        assert_eq!(snapshot.status, TimerStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_pause_and_start_never_strands_a_running_timer() {
        let (service, _) = service_with(Arc::new(NoopAlarmSink));
        service.start().await.expect("start");

        for _ in 0..10 {
            let (paused, started) = tokio::join!(service.pause(), service.start());
            paused.expect("pause");
            started.expect("start");

            let before = service.snapshot().await;
            time::sleep(Duration::from_millis(250)).await;
            let after = service.snapshot().await;
            if after.status == TimerStatus::Running {
                assert!(after.remaining_seconds < before.remaining_seconds);
            } else {
                assert_eq!(after.remaining_seconds, before.remaining_seconds);
            }
            service.reset().await.expect("reset");
            service.start().await.expect("restart");
        }
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_history_write_keeps_session_for_retry() {
        let repository = Arc::new(FlakyHistoryRepository::default());
        repository.fail.store(true, Ordering::SeqCst);
        let (service, ledger) = service_over(Arc::clone(&repository), Arc::new(NoopAlarmSink));

        service.start().await.expect("start");
        service.skip_phase().await.expect("skip focus");
        assert!(service.skip_phase().await.is_err());
        assert!(ledger.records().expect("records").is_empty());

        repository.fail.store(false, Ordering::SeqCst);
        service.shutdown().await;
        let stored = ledger.records().expect("records");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, fixed_time("2026-02-16T10:00:00Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn noop_transition_is_not_published() {
        let (service, _) = service_with(Arc::new(NoopAlarmSink));
        let mut events = service.subscribe();

        service.pause().await.expect("pause idle timer");
        assert!(events.try_recv().is_err());
    }
}
