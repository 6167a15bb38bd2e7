pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod storage;
pub mod types;

// Ports and their adapters
pub mod app;
pub mod infra;

pub mod observability;
