pub mod log_watcher;

pub use log_watcher::{shell_escape, LogWatcher, WatchedCommand, WatchedLog};
