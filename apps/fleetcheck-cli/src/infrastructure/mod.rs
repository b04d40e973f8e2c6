pub mod cloud;
pub mod connectors;
pub mod shell;
pub mod ssh;
pub mod trend;
