pub mod diff;
pub mod log_msg;
pub mod logging;
pub mod msg_store;
pub mod path;
pub mod shell;
pub mod text;
