//! Integration tests for the Dockyard server

mod common;
mod test_backup;
mod test_injector;
mod test_lifecycle;
