pub mod command;
pub mod env;
pub mod executors;
pub mod logs;
pub mod profile;
pub mod session_resolver;
pub mod storage;
