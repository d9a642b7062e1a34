use crate::application::bootstrap::bootstrap_workspace;
use crate::application::history_ledger::HistoryLedger;
use crate::application::history_sync::{HistorySyncService, SyncOutcome};
use crate::application::timer_service::{TimerEvent, TimerService};
use crate::domain::history::{HistorySummary, summarize};
use crate::domain::models::{SessionRecord, SettingsUpdate};
use crate::domain::timer::TimerSnapshot;
use crate::infrastructure::alarm::{AlarmSink, LogAlarmSink};
use crate::infrastructure::config::{AppConfig, save_timer_durations};
use crate::infrastructure::credential_store::{KeyringSyncCodeStore, SyncCodeStore, normalize_sync_code};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_repository::SqliteHistoryRepository;
use crate::infrastructure::sync_client::ReqwestHistorySyncClient;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const DEFAULT_SUMMARY_DAYS: i64 = 7;

type AppTimerService = TimerService<SqliteHistoryRepository, dyn AlarmSink>;
type AppSyncService = HistorySyncService<ReqwestHistorySyncClient, SqliteHistoryRepository>;

pub struct AppState {
    config_dir: PathBuf,
    logs_dir: PathBuf,
    config: Mutex<AppConfig>,
    ledger: Arc<HistoryLedger<SqliteHistoryRepository>>,
    timer: AppTimerService,
    sync: AppSyncService,
    sync_codes: Arc<dyn SyncCodeStore>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::with_components(
            workspace_root,
            Arc::new(LogAlarmSink),
            Arc::new(KeyringSyncCodeStore::default()),
        )
    }

    pub fn with_components(
        workspace_root: PathBuf,
        alarm_sink: Arc<dyn AlarmSink>,
        sync_codes: Arc<dyn SyncCodeStore>,
    ) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let config = bootstrap.config;

        let repository = Arc::new(SqliteHistoryRepository::new(&bootstrap.database_path));
        let ledger = Arc::new(HistoryLedger::new(repository));
        let timer = TimerService::new(config.timer.clone(), Arc::clone(&ledger), alarm_sink);
        let sync_client = Arc::new(ReqwestHistorySyncClient::new(
            config.sync_endpoint.clone(),
            config.sync_timeout,
        )?);
        let sync = HistorySyncService::new(sync_client, Arc::clone(&ledger))
            .with_timeout(config.sync_timeout);

        Ok(Self {
            config_dir: bootstrap.config_dir,
            logs_dir: bootstrap.logs_dir,
            config: Mutex::new(config),
            ledger,
            timer,
            sync,
            sync_codes,
            log_guard: Mutex::new(()),
        })
    }

    pub fn subscribe_timer(&self) -> broadcast::Receiver<TimerEvent> {
        self.timer.subscribe()
    }

    pub async fn shutdown(&self) {
        self.timer.shutdown().await;
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsResponse {
    pub focus_minutes: u64,
    pub break_minutes: u64,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoryItemResponse {
    pub id: String,
    pub timestamp: String,
    pub focus_seconds: u64,
    pub break_seconds: u64,
}

impl From<SessionRecord> for HistoryItemResponse {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            timestamp: record.timestamp.to_rfc3339(),
            focus_seconds: record.focus_seconds,
            break_seconds: record.break_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistorySummaryResponse {
    pub start: String,
    pub end: String,
    pub session_count: u32,
    pub total_focus_minutes: u64,
    pub total_break_minutes: u64,
}

impl From<HistorySummary> for HistorySummaryResponse {
    fn from(summary: HistorySummary) -> Self {
        Self {
            start: summary.start.to_rfc3339(),
            end: summary.end.to_rfc3339(),
            session_count: summary.session_count,
            total_focus_minutes: summary.total_focus_minutes,
            total_break_minutes: summary.total_break_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncHistoryResponse {
    pub total: usize,
    pub added: usize,
    pub updated: usize,
    pub synced_at: String,
}

impl From<SyncOutcome> for SyncHistoryResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            total: outcome.total,
            added: outcome.added,
            updated: outcome.updated,
            synced_at: outcome.synced_at.to_rfc3339(),
        }
    }
}

fn log_transition(state: &AppState, command: &str, event: &TimerEvent) {
    let snapshot = &event.snapshot;
    let mut message = format!(
        "mode={} status={} remaining={}",
        snapshot.mode.as_str(),
        snapshot.status.as_str(),
        snapshot.display
    );
    if let Some(record) = event.committed.as_ref() {
        message.push_str(&format!(" committed={}", record.id));
    }
    state.log_info(command, &message);
}

pub async fn start_timer_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.start().await?;
    log_transition(state, "start_timer", &event);
    Ok(event.snapshot)
}

pub async fn pause_timer_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.pause().await?;
    log_transition(state, "pause_timer", &event);
    Ok(event.snapshot)
}

pub async fn reset_timer_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.reset().await?;
    log_transition(state, "reset_timer", &event);
    Ok(event.snapshot)
}

pub async fn skip_phase_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.skip_phase().await?;
    log_transition(state, "skip_phase", &event);
    Ok(event.snapshot)
}

pub async fn confirm_phase_end_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.confirm_phase_end().await?;
    log_transition(state, "confirm_phase_end", &event);
    Ok(event.snapshot)
}

pub async fn continue_overtime_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    let event = state.timer.continue_overtime().await?;
    log_transition(state, "continue_overtime", &event);
    Ok(event.snapshot)
}

pub async fn get_timer_state_impl(state: &AppState) -> Result<TimerSnapshot, InfraError> {
    Ok(state.timer.snapshot().await)
}

/// Positive values are persisted and applied; non-positive values are logged
/// and ignored so the previous duration stays in effect.
pub async fn update_settings_impl(
    state: &AppState,
    focus_minutes: Option<i64>,
    break_minutes: Option<i64>,
) -> Result<SettingsResponse, InfraError> {
    let update = SettingsUpdate {
        focus_minutes,
        break_minutes,
    };
    for (field, value) in [("focus_minutes", focus_minutes), ("break_minutes", break_minutes)] {
        if let Some(minutes) = value.filter(|minutes| *minutes <= 0) {
            state.log_error(
                "update_settings",
                &format!("ignored non-positive {field}={minutes}"),
            );
        }
    }

    save_timer_durations(&state.config_dir, &update)?;
    let event = state.timer.update_settings(update.clone()).await?;

    let settings = {
        let mut config = state
            .config
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("config lock poisoned: {error}")))?;
        config.timer.apply(&update);
        config.timer.clone()
    };

    state.log_info(
        "update_settings",
        &format!(
            "focus_minutes={} break_minutes={} timer={}",
            settings.focus_minutes(),
            settings.break_minutes(),
            event.snapshot.display
        ),
    );
    Ok(SettingsResponse {
        focus_minutes: settings.focus_minutes(),
        break_minutes: settings.break_minutes(),
        tick_interval_ms: u64::try_from(settings.tick_interval.as_millis()).unwrap_or(u64::MAX),
    })
}

pub fn list_history_impl(state: &AppState) -> Result<Vec<HistoryItemResponse>, InfraError> {
    let records = state.ledger.sorted_records()?;
    state.log_info("list_history", &format!("records={}", records.len()));
    Ok(records.into_iter().map(HistoryItemResponse::from).collect())
}

pub fn history_summary_impl(
    state: &AppState,
    start: Option<String>,
    end: Option<String>,
) -> Result<HistorySummaryResponse, InfraError> {
    let now = Utc::now();
    let start = match start {
        Some(raw) => parse_datetime_input(&raw, "start")?,
        None => now - Duration::days(DEFAULT_SUMMARY_DAYS),
    };
    let end = match end {
        Some(raw) => parse_datetime_input(&raw, "end")?,
        None => now,
    };
    if end <= start {
        return Err(InfraError::InvalidConfig(
            "end must be greater than start".to_string(),
        ));
    }

    let records = state.ledger.records()?;
    let summary = summarize(&records, start, end);
    state.log_info(
        "history_summary",
        &format!(
            "sessions={} focus_minutes={}",
            summary.session_count, summary.total_focus_minutes
        ),
    );
    Ok(summary.into())
}

pub fn save_sync_code_impl(state: &AppState, code: String) -> Result<bool, InfraError> {
    let code = normalize_sync_code(&code)?;
    state.sync_codes.save_code(&code)?;
    state.log_info("save_sync_code", "stored sync code");
    Ok(true)
}

pub fn clear_sync_code_impl(state: &AppState) -> Result<bool, InfraError> {
    let had_code = state.sync_codes.load_code()?.is_some();
    state.sync_codes.delete_code()?;
    state.log_info("clear_sync_code", &format!("had_code={had_code}"));
    Ok(had_code)
}

pub async fn sync_history_impl(
    state: &AppState,
    code: Option<String>,
) -> Result<SyncHistoryResponse, InfraError> {
    let code = match code
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(code) => code.to_string(),
        None => state
            .sync_codes
            .load_code()?
            .ok_or_else(|| InfraError::Credential("sync code is not set".to_string()))?,
    };

    let outcome = state.sync.sync(&code).await?;
    state.log_info(
        "sync_history",
        &format!(
            "total={} added={} updated={}",
            outcome.total, outcome.added, outcome.updated
        ),
    );
    Ok(outcome.into())
}

fn parse_datetime_input(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Some(midnight) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(InfraError::InvalidConfig(format!(
        "{field_name} must be RFC3339 or YYYY-MM-DD"
    )))
}
