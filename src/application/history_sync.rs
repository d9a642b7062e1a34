use crate::application::history_ledger::{HistoryLedger, run_blocking};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_repository::HistoryRepository;
use crate::infrastructure::sync_client::HistorySyncClient;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncOutcome {
    pub total: usize,
    pub added: usize,
    pub updated: usize,
    pub synced_at: DateTime<Utc>,
}

pub struct HistorySyncService<C, R>
where
    C: HistorySyncClient,
    R: HistoryRepository,
{
    sync_client: Arc<C>,
    ledger: Arc<HistoryLedger<R>>,
    timeout: Duration,
    in_flight: AtomicBool,
    now_provider: NowProvider,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C, R> HistorySyncService<C, R>
where
    C: HistorySyncClient,
    R: HistoryRepository + 'static,
{
    pub fn new(sync_client: Arc<C>, ledger: Arc<HistoryLedger<R>>) -> Self {
        Self {
            sync_client,
            ledger,
            timeout: DEFAULT_SYNC_TIMEOUT,
            in_flight: AtomicBool::new(false),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sends the local history, merges the response, and overwrites the stored
    /// history with the result. On any failure the stored history is untouched.
    pub async fn sync(&self, code: &str) -> Result<SyncOutcome, InfraError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(InfraError::Sync("sync code must not be empty".to_string()));
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InfraError::SyncInProgress);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let ledger = Arc::clone(&self.ledger);
        let local = run_blocking(move || ledger.records()).await?;
        let remote = match tokio::time::timeout(self.timeout, self.sync_client.exchange(code, &local))
            .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(error)) => {
                warn!("history sync failed: {error}");
                return Err(error);
            }
            Err(_) => {
                warn!("history sync timed out after {:?}", self.timeout);
                return Err(InfraError::Sync(format!(
                    "timed out after {} seconds",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        let ledger = Arc::clone(&self.ledger);
        let merged = run_blocking(move || ledger.apply_remote(remote)).await?;
        info!(
            "history sync merged {} records ({} added, {} updated)",
            merged.records.len(),
            merged.added,
            merged.updated
        );

        Ok(SyncOutcome {
            total: merged.records.len(),
            added: merged.added,
            updated: merged.updated,
            synced_at: (self.now_provider)(),
        })
    }
}
