use crate::domain::history::{MergeResult, merge_histories, sort_most_recent_first};
use crate::domain::models::SessionRecord;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_repository::HistoryRepository;
use std::sync::{Arc, Mutex, MutexGuard};

/// Single writer for the stored history. Commits and merge results are applied
/// under the same lock, each against a fresh read of the stored collection.
pub struct HistoryLedger<R>
where
    R: HistoryRepository,
{
    repository: Arc<R>,
    write_lock: Mutex<()>,
}

impl<R> HistoryLedger<R>
where
    R: HistoryRepository,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, InfraError> {
        self.write_lock
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("history ledger lock poisoned: {error}")))
    }

    pub fn records(&self) -> Result<Vec<SessionRecord>, InfraError> {
        let _guard = self.lock()?;
        self.repository.load()
    }

    /// Writes `records` (oldest first) ahead of the stored history in one save,
    /// so either every record lands or none does.
    pub fn prepend_all(&self, records: Vec<SessionRecord>) -> Result<(), InfraError> {
        for record in &records {
            record.validate().map_err(InfraError::RecordDecode)?;
        }
        let _guard = self.lock()?;
        let mut stored = self.repository.load()?;
        for record in records {
            stored.retain(|existing| existing.id != record.id);
            stored.insert(0, record);
        }
        self.repository.save(&stored)
    }

    /// Merges `remote` into whatever is stored right now, then overwrites the
    /// stored collection with the merged result.
    pub fn apply_remote(&self, remote: Vec<SessionRecord>) -> Result<MergeResult, InfraError> {
        let _guard = self.lock()?;
        let local = self.repository.load()?;
        let merged = merge_histories(&local, remote);
        self.repository.save(&merged.records)?;
        Ok(merged)
    }

    pub fn sorted_records(&self) -> Result<Vec<SessionRecord>, InfraError> {
        let mut records = self.records()?;
        sort_most_recent_first(&mut records);
        Ok(records)
    }
}

/// Runs a ledger call on the blocking pool so SQLite I/O stays off async workers.
pub async fn run_blocking<T, F>(task: F) -> Result<T, InfraError>
where
    F: FnOnce() -> Result<T, InfraError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|error| InfraError::Task(error.to_string()))?
}
