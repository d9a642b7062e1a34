pub mod bootstrap;
pub mod commands;
pub mod history_ledger;
pub mod history_sync;
pub mod timer_service;
