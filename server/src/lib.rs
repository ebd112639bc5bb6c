//! Dockyard Server Library
//!
//! Deployment lifecycle, tunnel agent injection and backups for Docker
//! Compose stacks.

pub mod app;
pub mod backup;
pub mod compose;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod templates;
pub mod utils;
pub mod workers;
