pub mod active_executions;
pub mod config;
pub mod execution;
pub mod log_source;
