//! Deployment lifecycle and orchestration

pub mod events;
pub mod fsm;
pub mod lifecycle;
pub mod orchestrator;
pub mod tasks;

pub use lifecycle::{DeploymentLifecycle, LifecycleOptions};
pub use orchestrator::{ComposeCli, Orchestrator};
