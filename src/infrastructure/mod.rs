pub mod alarm;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod history_repository;
pub mod record_codec;
pub mod storage;
pub mod sync_client;
