//! Background workers

pub mod update_watcher;
