pub mod browse;
pub mod config_cmd;
pub mod run_cmd;
pub mod runtime;
pub mod status;
