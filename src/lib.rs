pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod settings;
