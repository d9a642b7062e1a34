use crate::domain::history::dedupe_by_id;
use crate::domain::models::SessionRecord;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const FIXED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const KEY_ID: &str = "id";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_FOCUS_SECONDS: &str = "focusSeconds";
const KEY_BREAK_SECONDS: &str = "breakSeconds";
const LEGACY_KEY_DATE: &str = "date";
const LEGACY_KEY_FOCUS_TIME: &str = "focusTime";
const LEGACY_KEY_BREAK_TIME: &str = "breakTime";
const KEY_LAST_MODIFIED: &str = "lastModified";

type TimestampParser = fn(&str) -> Option<DateTime<Utc>>;

/// Tried in order; the first parser that accepts the input wins.
const TIMESTAMP_PARSERS: [(&str, TimestampParser); 3] = [
    ("iso8601-fractional", parse_iso_fractional),
    ("iso8601", parse_iso_whole),
    ("sql", parse_sql),
];

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(FIXED_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    TIMESTAMP_PARSERS.iter().find_map(|(_, parser)| parser(raw))
}

fn parse_iso_fractional(raw: &str) -> Option<DateTime<Utc>> {
    let (_, time) = raw.split_once('T')?;
    if !time.contains('.') {
        return None;
    }
    parse_iso(raw, "%Y-%m-%dT%H:%M:%S%.f")
}

fn parse_iso_whole(raw: &str) -> Option<DateTime<Utc>> {
    let (_, time) = raw.split_once('T')?;
    if time.contains('.') {
        return None;
    }
    parse_iso(raw, "%Y-%m-%dT%H:%M:%S")
}

fn parse_iso(raw: &str, naive_format: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, naive_format)
                .ok()
                .map(|value| value.and_utc())
        })
}

fn parse_sql(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, FIXED_TIMESTAMP_FORMAT)
        .ok()
        .map(|value| value.and_utc())
}

/// Current record layout, shared by the stored history slot and the sync wire.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord<'a> {
    pub id: &'a str,
    pub timestamp: String,
    pub focus_seconds: u64,
    pub break_seconds: u64,
}

impl<'a> From<&'a SessionRecord> for WireRecord<'a> {
    fn from(record: &'a SessionRecord) -> Self {
        Self {
            id: &record.id,
            timestamp: format_timestamp(&record.timestamp),
            focus_seconds: record.focus_seconds,
            break_seconds: record.break_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncRequest<'a> {
    pub code: &'a str,
    pub history: Vec<WireRecord<'a>>,
}

pub fn build_sync_request<'a>(code: &'a str, records: &'a [SessionRecord]) -> SyncRequest<'a> {
    SyncRequest {
        code,
        history: records.iter().map(WireRecord::from).collect(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRecord {
    id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    focus_seconds: u64,
    break_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    history: Vec<RemoteRecord>,
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

/// Accepts `{"history": [...]}` first and a bare array second.
pub fn decode_sync_response(body: &str) -> Result<Vec<SessionRecord>, InfraError> {
    let remote = match serde_json::from_str::<HistoryEnvelope>(body) {
        Ok(envelope) => envelope.history,
        Err(wrapped_error) => serde_json::from_str::<Vec<RemoteRecord>>(body).map_err(
            |bare_error| {
                InfraError::Sync(format!(
                    "invalid history payload: wrapped: {wrapped_error}; bare: {bare_error}"
                ))
            },
        )?,
    };

    remote
        .into_iter()
        .map(|record| -> Result<SessionRecord, InfraError> {
            let session = SessionRecord {
                id: record.id.trim().to_string(),
                timestamp: record.timestamp,
                focus_seconds: record.focus_seconds,
                break_seconds: record.break_seconds,
            };
            session
                .validate()
                .map_err(|error| InfraError::Sync(format!("invalid remote record: {error}")))?;
            Ok(session)
        })
        .collect()
}

pub fn encode_stored_history(records: &[SessionRecord]) -> Result<String, InfraError> {
    let wire = records.iter().map(WireRecord::from).collect::<Vec<_>>();
    Ok(serde_json::to_string(&wire)?)
}

/// Decodes the stored slot. Records that cannot be decoded are dropped one by
/// one; only a slot that is not a JSON array fails as a whole.
pub fn decode_stored_history(
    raw: &str,
    decoded_at: DateTime<Utc>,
) -> Result<Vec<SessionRecord>, InfraError> {
    let parsed: Value = serde_json::from_str(raw)?;
    let Some(items) = parsed.as_array() else {
        return Err(InfraError::RecordDecode(
            "stored history must be a JSON array".to_string(),
        ));
    };

    let records = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match decode_stored_record(item, decoded_at) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!("dropping stored history record #{index}: {error}");
                None
            }
        })
        .collect::<Vec<_>>();
    Ok(dedupe_by_id(records))
}

/// Current field names first, then the legacy layout. Identity is never backfilled.
pub fn decode_stored_record(
    value: &Value,
    decoded_at: DateTime<Utc>,
) -> Result<SessionRecord, InfraError> {
    let id = value
        .get(KEY_ID)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| InfraError::RecordDecode("record has no id".to_string()))?;

    let timestamp = first_timestamp(value, &[KEY_TIMESTAMP, LEGACY_KEY_DATE, KEY_LAST_MODIFIED])
        .unwrap_or(decoded_at);
    let focus_seconds = first_seconds(value, &[KEY_FOCUS_SECONDS, LEGACY_KEY_FOCUS_TIME]).unwrap_or(0);
    let break_seconds = first_seconds(value, &[KEY_BREAK_SECONDS, LEGACY_KEY_BREAK_TIME]).unwrap_or(0);

    Ok(SessionRecord {
        id: id.to_string(),
        timestamp,
        focus_seconds,
        break_seconds,
    })
}

fn first_timestamp(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str).and_then(parse_timestamp))
}

fn first_seconds(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| value.get(*key).and_then(seconds_value))
}

fn seconds_value(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(|seconds| seconds as u64)
    })
}
