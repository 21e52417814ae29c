pub mod check_log;
pub mod config;
pub mod plugins;
pub mod run;
