pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod runtime;
pub mod sanitize;
pub mod server;
pub mod store;
pub mod tasks;
