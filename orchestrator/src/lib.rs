//! dockhand library
//!
//! Core modules of the self-hosted deployment orchestrator.

pub mod app;
pub mod backup;
pub mod database;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod provision;
pub mod proxy;
pub mod remote;
pub mod runtime;
pub mod scm;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod vault;
pub mod workers;
