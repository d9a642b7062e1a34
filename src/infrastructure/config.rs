use crate::domain::models::{
    DEFAULT_BREAK_MINUTES, DEFAULT_FOCUS_MINUTES, SettingsUpdate, TimerSettings,
};
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

const APP_JSON: &str = "app.json";
const DEFAULT_SYNC_ENDPOINT: &str = "https://pomosync.example.com/api/sync";
const DEFAULT_SYNC_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_TICK_INTERVAL_SECONDS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub timer: TimerSettings,
    pub sync_endpoint: Url,
    pub sync_timeout: Duration,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([(
        APP_JSON,
        serde_json::json!({
            "schema": 1,
            "focusMinutes": DEFAULT_FOCUS_MINUTES,
            "breakMinutes": DEFAULT_BREAK_MINUTES,
            "tickIntervalSeconds": DEFAULT_TICK_INTERVAL_SECONDS,
            "syncEndpoint": DEFAULT_SYNC_ENDPOINT,
            "syncTimeoutSeconds": DEFAULT_SYNC_TIMEOUT_SECONDS,
            "theme": "system",
            "backgroundOpacity": 0.9
        }),
    )])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn write_config(path: &Path, value: &serde_json::Value) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let app = read_config(&path)?;

    let mut timer = TimerSettings::default();
    timer.apply(&SettingsUpdate {
        focus_minutes: app.get("focusMinutes").and_then(serde_json::Value::as_i64),
        break_minutes: app.get("breakMinutes").and_then(serde_json::Value::as_i64),
    });
    if let Some(tick_interval) = app
        .get("tickIntervalSeconds")
        .and_then(serde_json::Value::as_f64)
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
    {
        let candidate = TimerSettings {
            tick_interval,
            ..timer.clone()
        };
        if candidate.validate().is_ok() {
            timer = candidate;
        }
    }

    let endpoint_raw = app
        .get("syncEndpoint")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_SYNC_ENDPOINT);
    let sync_endpoint = parse_sync_endpoint(endpoint_raw)?;

    let sync_timeout = app
        .get("syncTimeoutSeconds")
        .and_then(serde_json::Value::as_u64)
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECONDS));

    Ok(AppConfig {
        timer,
        sync_endpoint,
        sync_timeout,
    })
}

pub fn parse_sync_endpoint(raw: &str) -> Result<Url, InfraError> {
    let url = Url::parse(raw)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid syncEndpoint '{raw}': {error}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(InfraError::InvalidConfig(format!(
            "syncEndpoint must use http or https, got '{other}'"
        ))),
    }
}

/// Persists the positive durations of `update`. Non-positive values are not
/// written, so the previously stored value stays in effect.
pub fn save_timer_durations(config_dir: &Path, update: &SettingsUpdate) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    let mut app = read_config(&path)?;
    let object = app.as_object_mut().ok_or_else(|| {
        InfraError::InvalidConfig(format!("invalid object structure in {}", path.display()))
    })?;

    let entries = [
        ("focusMinutes", update.focus_minutes),
        ("breakMinutes", update.break_minutes),
    ];
    for (key, value) in entries {
        if let Some(minutes) = value.filter(|minutes| *minutes > 0) {
            object.insert(key.to_string(), serde_json::Value::from(minutes));
        }
    }

    write_config(&path, &app)
}
