//! Compose documents and tunnel agent injection

pub mod document;
pub mod injector;

pub use document::ComposeDocument;
pub use injector::{ChangeSummary, InjectorConfig, TunnelInjector, ValidationReport};
