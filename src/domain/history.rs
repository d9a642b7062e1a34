use crate::domain::models::SessionRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub records: Vec<SessionRecord>,
    pub added: usize,
    pub updated: usize,
}

/// Identity-keyed merge where the remote copy of a record always wins.
/// Local-only records are kept; the result is ordered most recent first.
pub fn merge_histories(local: &[SessionRecord], remote: Vec<SessionRecord>) -> MergeResult {
    let mut by_id: HashMap<String, SessionRecord> = local
        .iter()
        .map(|record| (record.id.clone(), record.clone()))
        .collect();

    let mut added = 0;
    let mut updated = 0;
    for record in remote {
        match by_id.insert(record.id.clone(), record.clone()) {
            None => added += 1,
            Some(previous) if previous != record => updated += 1,
            Some(_) => {}
        }
    }

    let mut records = by_id.into_values().collect::<Vec<_>>();
    sort_most_recent_first(&mut records);
    MergeResult {
        records,
        added,
        updated,
    }
}

/// Descending by timestamp; equal timestamps fall back to ascending id so the
/// order is stable across devices.
pub fn sort_most_recent_first(records: &mut [SessionRecord]) {
    records.sort_by(|left, right| match right.timestamp.cmp(&left.timestamp) {
        Ordering::Equal => left.id.cmp(&right.id),
        other => other,
    });
}

/// Drops later duplicates of an id, keeping the first occurrence.
pub fn dedupe_by_id(records: Vec<SessionRecord>) -> Vec<SessionRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistorySummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub session_count: u32,
    pub total_focus_minutes: u64,
    pub total_break_minutes: u64,
}

pub fn summarize(
    records: &[SessionRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> HistorySummary {
    let in_range = records
        .iter()
        .filter(|record| record.timestamp >= start && record.timestamp <= end)
        .collect::<Vec<_>>();

    let focus_seconds: u64 = in_range.iter().map(|record| record.focus_seconds).sum();
    let break_seconds: u64 = in_range.iter().map(|record| record.break_seconds).sum();

    HistorySummary {
        start,
        end,
        session_count: u32::try_from(in_range.len()).unwrap_or(u32::MAX),
        total_focus_minutes: focus_seconds / 60,
        total_break_minutes: break_seconds / 60,
    }
}
