//! Data models

pub mod backup;
pub mod deployment;
