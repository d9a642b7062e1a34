use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

/// Holds the user-chosen code that pairs devices on the sync service.
pub trait SyncCodeStore: Send + Sync {
    fn save_code(&self, code: &str) -> Result<(), InfraError>;
    fn load_code(&self) -> Result<Option<String>, InfraError>;
    fn delete_code(&self) -> Result<(), InfraError>;
}

pub fn normalize_sync_code(code: &str) -> Result<String, InfraError> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(InfraError::Credential("sync code must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone)]
pub struct KeyringSyncCodeStore {
    service_name: String,
    account_name: String,
}

impl KeyringSyncCodeStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringSyncCodeStore {
    fn default() -> Self {
        Self::new("pomosync.sync-code", "default")
    }
}

impl SyncCodeStore for KeyringSyncCodeStore {
    fn save_code(&self, code: &str) -> Result<(), InfraError> {
        let code = normalize_sync_code(code)?;
        self.entry()?
            .set_password(&code)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_code(&self) -> Result<Option<String>, InfraError> {
        match self.entry()?.get_password() {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    fn delete_code(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncCodeStore {
    code: Mutex<Option<String>>,
}

impl SyncCodeStore for InMemorySyncCodeStore {
    fn save_code(&self, code: &str) -> Result<(), InfraError> {
        let code = normalize_sync_code(code)?;
        let mut guard = self
            .code
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(code);
        Ok(())
    }

    fn load_code(&self) -> Result<Option<String>, InfraError> {
        let guard = self
            .code
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.clone())
    }

    fn delete_code(&self) -> Result<(), InfraError> {
        let mut guard = self
            .code
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_trims_and_clears_code() {
        let store = InMemorySyncCodeStore::default();
        assert_eq!(store.load_code().expect("load"), None);

        store.save_code("  team-42 ").expect("save");
        assert_eq!(store.load_code().expect("load"), Some("team-42".to_string()));

        store.delete_code().expect("delete");
        assert_eq!(store.load_code().expect("load"), None);
    }

    #[test]
    fn blank_code_is_rejected() {
        let store = InMemorySyncCodeStore::default();
        assert!(matches!(store.save_code("   "), Err(InfraError::Credential(_))));
    }
}
