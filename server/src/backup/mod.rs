//! Backup capture, restore, encryption and archive storage

pub mod archive;
pub mod encryption;
pub mod engine;
pub mod retention;
pub mod schedules;
pub mod storage;

pub use engine::{BackupEngine, BackupEngineOptions};
pub use schedules::ScheduleBook;
pub use storage::{create_storage_backend, LocalStorage, StorageBackend};
