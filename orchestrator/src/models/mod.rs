//! Persisted domain records

pub mod app;
pub mod backup;
pub mod database;
pub mod host;
