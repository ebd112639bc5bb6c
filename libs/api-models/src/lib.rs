//! HTTP API models for the Dockyard server

pub mod models;

pub use models::*;
