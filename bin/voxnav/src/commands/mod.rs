pub mod app;
pub mod config_cmd;
pub mod doctor;
pub mod gateway;
pub mod run_cmd;
pub mod serve;
pub mod tasks_cmd;
